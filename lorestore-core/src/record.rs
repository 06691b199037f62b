// Copyright 2025 Lorestore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Log records: the unit of durability.
//!
//! Each record is one self-describing JSON line tagged with `recordType`.
//! Records are fully specified, so the latest record per identity wins on
//! replay.

use crate::error::Result;
use crate::model::{Entity, EntityId, Relationship, RelationshipKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single durable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recordType", rename_all = "snake_case")]
pub enum LogRecord {
    Entity(Entity),
    Relationship(Relationship),
}

impl LogRecord {
    pub fn stream(&self) -> RecordStream {
        match self {
            LogRecord::Entity(_) => RecordStream::Entities,
            LogRecord::Relationship(_) => RecordStream::Relationships,
        }
    }

    /// Identity under which later records supersede earlier ones
    pub fn identity(&self) -> RecordIdentity {
        match self {
            LogRecord::Entity(e) => RecordIdentity::Entity(e.id.clone()),
            LogRecord::Relationship(r) => RecordIdentity::Relationship(r.key()),
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Entity(e) => e.updated_at,
            LogRecord::Relationship(r) => r.updated_at,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LogRecord::Entity(e) => e.validate(),
            LogRecord::Relationship(r) => r.validate(),
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            LogRecord::Entity(e) => Some(e),
            LogRecord::Relationship(_) => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            LogRecord::Relationship(r) => Some(r),
            LogRecord::Entity(_) => None,
        }
    }

    /// Serialize to a single line without the trailing newline
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

impl From<Entity> for LogRecord {
    fn from(entity: Entity) -> Self {
        LogRecord::Entity(entity)
    }
}

impl From<Relationship> for LogRecord {
    fn from(relationship: Relationship) -> Self {
        LogRecord::Relationship(relationship)
    }
}

/// Which log file a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStream {
    Entities,
    Relationships,
}

impl RecordStream {
    pub const ALL: [RecordStream; 2] = [RecordStream::Entities, RecordStream::Relationships];

    pub fn file_name(&self) -> &'static str {
        match self {
            RecordStream::Entities => "entities.log",
            RecordStream::Relationships => "relationships.log",
        }
    }
}

impl fmt::Display for RecordStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStream::Entities => f.write_str("entities"),
            RecordStream::Relationships => f.write_str("relationships"),
        }
    }
}

/// Position of an appended record: stream plus zero-based line number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub stream: RecordStream,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordIdentity {
    Entity(EntityId),
    Relationship(RelationshipKey),
}
