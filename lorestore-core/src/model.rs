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

//! Entity and Relationship Types
//!
//! Defines the nodes and edges of the knowledge graph. Both carry an open
//! property bag modelled as a typed sum ([`PropertyValue`]) so new attributes
//! can appear without schema changes.

use crate::error::{LorestoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// A unique identifier for entities in the knowledge graph
pub type EntityId = String;

/// Ordered property bag (ordered so serialized records are byte-stable)
pub type Properties = BTreeMap<String, PropertyValue>;

/// Maximum entity id length
pub const MAX_ID_LEN: usize = 256;

/// A property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<PropertyValue>),
    Map(Properties),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Scalar rendering used for categorical comparisons and CSV export.
    /// Lists and maps have no scalar form.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(b) => Some(b.to_string()),
            PropertyValue::Number(n) => Some(n.to_string()),
            PropertyValue::Text(s) => Some(s.clone()),
            PropertyValue::List(_) | PropertyValue::Map(_) => None,
        }
    }

    /// Collect every text fragment reachable from this value (used by recall)
    pub fn collect_text<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            PropertyValue::Text(s) => out.push(s.as_str()),
            PropertyValue::List(items) => items.iter().for_each(|v| v.collect_text(out)),
            PropertyValue::Map(map) => map.values().for_each(|v| v.collect_text(out)),
            _ => {}
        }
    }

    fn check_finite(&self, path: &str) -> Result<()> {
        match self {
            PropertyValue::Number(n) if !n.is_finite() => Err(LorestoreError::validation(
                format!("property '{}' is not a finite number", path),
            )),
            PropertyValue::List(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, v)| v.check_finite(&format!("{}[{}]", path, i))),
            PropertyValue::Map(map) => validate_properties_at(map, path),
            _ => Ok(()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value as f64)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::Number(value as f64)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(PropertyValue::Null, PropertyValue::Number),
            serde_json::Value::String(s) => PropertyValue::Text(s),
            serde_json::Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect())
            }
            serde_json::Value::Object(map) => PropertyValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, PropertyValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Convert a JSON object into a property bag
pub fn properties_from_json(value: serde_json::Value) -> Result<Properties> {
    match PropertyValue::from(value) {
        PropertyValue::Map(map) => Ok(map),
        PropertyValue::Null => Ok(Properties::new()),
        _ => Err(LorestoreError::validation("properties must be a JSON object")),
    }
}

/// Reject empty keys and non-finite numbers anywhere in the bag
pub fn validate_properties(properties: &Properties) -> Result<()> {
    validate_properties_at(properties, "")
}

fn validate_properties_at(properties: &Properties, prefix: &str) -> Result<()> {
    for (key, value) in properties {
        if key.trim().is_empty() {
            return Err(LorestoreError::validation("property keys must not be empty"));
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        value.check_finite(&path)?;
    }
    Ok(())
}

/// Validate an entity id: non-empty, bounded, no control characters
pub fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(LorestoreError::validation("entity id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(LorestoreError::validation(format!(
            "entity id exceeds {} bytes",
            MAX_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(LorestoreError::validation(
            "entity id must not contain control characters",
        ));
    }
    Ok(())
}

/// Entity kinds in the knowledge graph (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// An analyzed software project
    Project,
    /// A user and their preferences
    User,
    /// A generator/deployment configuration
    Configuration,
    /// A language, framework or tool
    Technology,
    /// A section of generated or existing documentation
    DocumentationSection,
    /// A source file
    CodeFile,
    /// A recorded (context, outcome) observation for the learning loop
    Observation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Project,
        EntityKind::User,
        EntityKind::Configuration,
        EntityKind::Technology,
        EntityKind::DocumentationSection,
        EntityKind::CodeFile,
        EntityKind::Observation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::User => "user",
            EntityKind::Configuration => "configuration",
            EntityKind::Technology => "technology",
            EntityKind::DocumentationSection => "documentation_section",
            EntityKind::CodeFile => "code_file",
            EntityKind::Observation => "observation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = LorestoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "project" => Ok(EntityKind::Project),
            "user" => Ok(EntityKind::User),
            "configuration" | "config" => Ok(EntityKind::Configuration),
            "technology" | "tech" => Ok(EntityKind::Technology),
            "documentation_section" | "documentation" | "doc_section" => {
                Ok(EntityKind::DocumentationSection)
            }
            "code_file" | "file" => Ok(EntityKind::CodeFile),
            "observation" => Ok(EntityKind::Observation),
            other => Err(LorestoreError::validation(format!(
                "unknown entity kind '{}'",
                other
            ))),
        }
    }
}

/// Relationship types between entities (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationType {
    /// Project uses a technology
    UsesTechnology,
    /// Project was deployed with a configuration (edge carries the outcome)
    DeployedWith,
    /// Two entities are similar
    SimilarTo,
    /// Documentation documents code
    Documents,
    /// A references B
    References,
    /// Documentation is outdated for code
    OutdatedFor,
    /// A depends on B
    DependsOn,
    /// User prefers something
    Prefers,
    /// A recommends B
    Recommends,
}

impl RelationType {
    pub const ALL: [RelationType; 9] = [
        RelationType::UsesTechnology,
        RelationType::DeployedWith,
        RelationType::SimilarTo,
        RelationType::Documents,
        RelationType::References,
        RelationType::OutdatedFor,
        RelationType::DependsOn,
        RelationType::Prefers,
        RelationType::Recommends,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::UsesTechnology => "uses-technology",
            RelationType::DeployedWith => "deployed-with",
            RelationType::SimilarTo => "similar-to",
            RelationType::Documents => "documents",
            RelationType::References => "references",
            RelationType::OutdatedFor => "outdated-for",
            RelationType::DependsOn => "depends-on",
            RelationType::Prefers => "prefers",
            RelationType::Recommends => "recommends",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = LorestoreError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace(['_', ' '], "-");
        RelationType::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| {
                LorestoreError::validation(format!("unknown relationship type '{}'", s.trim()))
            })
    }
}

/// A knowledge graph entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier, immutable
    pub id: EntityId,
    /// Entity kind, immutable
    pub kind: EntityKind,
    /// Kind-specific attributes
    #[serde(default)]
    pub properties: Properties,
    /// Free-form tags used for clustering and search
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// First time the entity was remembered
    pub created_at: DateTime<Utc>,
    /// Last update
    #[serde(rename = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create a new entity stamped with the current time
    pub fn new(id: impl Into<EntityId>, kind: EntityKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            properties: Properties::new(),
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags.extend(normalize_tags(tags));
        self
    }

    /// Override both timestamps (imports, replays and tests)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_at = timestamp;
        self.updated_at = timestamp;
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn text_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(PropertyValue::as_str)
    }

    pub fn number_property(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(PropertyValue::as_f64)
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        validate_properties(&self.properties)?;
        if self.updated_at < self.created_at {
            return Err(LorestoreError::validation(format!(
                "entity '{}' updated before it was created",
                self.id
            )));
        }
        Ok(())
    }

    /// Fold an update for the same id into this entity.
    ///
    /// Properties are merged (incoming keys win), tags are unioned and
    /// `created_at` is kept. The kind must not change.
    pub fn merged_with(&self, incoming: &Entity) -> Result<Entity> {
        if self.id != incoming.id {
            return Err(LorestoreError::validation(format!(
                "cannot merge entity '{}' into '{}'",
                incoming.id, self.id
            )));
        }
        if self.kind != incoming.kind {
            return Err(LorestoreError::validation(format!(
                "entity '{}' is a {} and cannot become a {}",
                self.id, self.kind, incoming.kind
            )));
        }
        let mut merged = self.clone();
        merged
            .properties
            .extend(incoming.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.tags.extend(incoming.tags.iter().cloned());
        merged.updated_at = incoming.updated_at.max(self.updated_at);
        Ok(merged)
    }
}

/// Trim tags and drop empty ones
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Identity of a relationship: at most one active edge per triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipKey {
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(rename = "type")]
    pub relation: RelationType,
}

impl RelationshipKey {
    pub fn new(
        source_id: impl Into<EntityId>,
        target_id: impl Into<EntityId>,
        relation: RelationType,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation,
        }
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source_id, self.relation, self.target_id)
    }
}

fn default_weight() -> f64 {
    1.0
}

/// Directed, weighted edge in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(rename = "type")]
    pub relation: RelationType,
    /// Weight / confidence in [0, 1]
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<EntityId>,
        target_id: impl Into<EntityId>,
        relation: RelationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation,
            weight: default_weight(),
            properties: Properties::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_at = timestamp;
        self.updated_at = timestamp;
        self
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey::new(self.source_id.clone(), self.target_id.clone(), self.relation)
    }

    /// Outcome flag recorded on the edge, if any
    pub fn success(&self) -> Option<bool> {
        self.properties.get("success").and_then(PropertyValue::as_bool)
    }

    /// The endpoint opposite to `id`
    pub fn other_end(&self, id: &str) -> &str {
        if self.source_id == id {
            &self.target_id
        } else {
            &self.source_id
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.source_id)?;
        validate_id(&self.target_id)?;
        if !self.weight.is_finite() || !(0.0..=1.0).contains(&self.weight) {
            return Err(LorestoreError::validation(format!(
                "relationship {} has weight {} outside [0, 1]",
                self.key(),
                self.weight
            )));
        }
        validate_properties(&self.properties)?;
        if self.updated_at < self.created_at {
            return Err(LorestoreError::validation(format!(
                "relationship {} updated before it was created",
                self.key()
            )));
        }
        Ok(())
    }

    /// Fold a re-assertion of the same triple into this edge: latest weight,
    /// merged properties, original `created_at`.
    pub fn merged_with(&self, incoming: &Relationship) -> Relationship {
        let mut merged = self.clone();
        merged.weight = incoming.weight;
        merged
            .properties
            .extend(incoming.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.updated_at = incoming.updated_at.max(self.updated_at);
        merged
    }
}
