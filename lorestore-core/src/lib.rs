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

//! Lorestore Core
//!
//! Fundamental data structures for the knowledge-graph memory: entities,
//! relationships, the durable log record and the shared error type.

pub mod error;
pub mod model;
pub mod record;
pub mod resilience;

pub use error::{LorestoreError, Result};
pub use model::{
    normalize_tags, properties_from_json, validate_id, validate_properties, Entity, EntityId,
    EntityKind, Properties, PropertyValue, RelationType, Relationship, RelationshipKey,
    MAX_ID_LEN,
};
pub use record::{LogRecord, RecordId, RecordIdentity, RecordStream};
pub use resilience::RetryPolicy;
