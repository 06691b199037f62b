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

//! Snapshot export and import
//!
//! The native format is a self-describing JSON document:
//!
//! ```text
//! { "format": "lorestore-snapshot", "formatVersion": 1, "createdAt": ...,
//!   "entityCount": n, "relationshipCount": m, "checksum": "<blake3>",
//!   "entities": [...], "relationships": [...] }
//! ```
//!
//! The checksum covers the canonical payload (entities sorted by id,
//! relationships sorted by key). GraphML and CSV are export-only views for
//! external graph tools.

use chrono::{DateTime, Utc};
use lorestore_core::{
    Entity, EntityKind, LogRecord, LorestoreError, Relationship, RelationshipKey, Result,
};
use lorestore_index::GraphIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

pub const SNAPSHOT_FORMAT: &str = "lorestore-snapshot";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format: String,
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub checksum: String,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

/// Fields every snapshot version carries
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotHeader {
    format: String,
    format_version: u32,
}

#[derive(Serialize)]
struct Payload<'a> {
    entities: &'a [Entity],
    relationships: &'a [Relationship],
}

impl Snapshot {
    /// Build a snapshot; entities and relationships are put in canonical order
    pub fn new(mut entities: Vec<Entity>, mut relationships: Vec<Relationship>) -> Result<Self> {
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        relationships.sort_by_key(Relationship::key);
        let checksum = payload_checksum(&entities, &relationships)?;
        Ok(Self {
            format: SNAPSHOT_FORMAT.to_string(),
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at: Utc::now(),
            entity_count: entities.len(),
            relationship_count: relationships.len(),
            checksum,
            entities,
            relationships,
        })
    }

    /// Parse and verify a native snapshot
    pub fn from_slice(blob: &[u8]) -> Result<Self> {
        let header: SnapshotHeader = serde_json::from_slice(blob)?;
        if header.format != SNAPSHOT_FORMAT {
            return Err(LorestoreError::validation(format!(
                "not a lorestore snapshot (format '{}')",
                header.format
            )));
        }
        if header.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(LorestoreError::IncompatibleVersion {
                found: header.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        if header.format_version == 0 {
            return Err(LorestoreError::validation("snapshot format version 0 is invalid"));
        }

        let snapshot: Snapshot = serde_json::from_slice(blob)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Check counts, checksum, record validity and uniqueness
    pub fn verify(&self) -> Result<()> {
        if self.entity_count != self.entities.len()
            || self.relationship_count != self.relationships.len()
        {
            return Err(LorestoreError::validation(format!(
                "snapshot declares {} entities and {} relationships but contains {} and {}",
                self.entity_count,
                self.relationship_count,
                self.entities.len(),
                self.relationships.len()
            )));
        }

        let actual = payload_checksum(&self.entities, &self.relationships)?;
        if actual != self.checksum {
            return Err(LorestoreError::validation(format!(
                "snapshot checksum mismatch (expected {}, computed {})",
                self.checksum, actual
            )));
        }

        let mut ids = HashSet::with_capacity(self.entities.len());
        for entity in &self.entities {
            entity.validate()?;
            if !ids.insert(entity.id.as_str()) {
                return Err(LorestoreError::validation(format!(
                    "snapshot contains entity '{}' twice",
                    entity.id
                )));
            }
        }
        let mut keys = HashSet::with_capacity(self.relationships.len());
        for relationship in &self.relationships {
            relationship.validate()?;
            if !keys.insert(relationship.key()) {
                return Err(LorestoreError::validation(format!(
                    "snapshot contains relationship {} twice",
                    relationship.key()
                )));
            }
        }
        Ok(())
    }
}

fn payload_checksum(entities: &[Entity], relationships: &[Relationship]) -> Result<String> {
    let payload = serde_json::to_vec(&Payload {
        entities,
        relationships,
    })?;
    Ok(blake3::hash(&payload).to_hex().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Native snapshot (importable)
    Json,
    GraphMl,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::GraphMl => "graphml",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = LorestoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" | "snapshot" => Ok(ExportFormat::Json),
            "graphml" | "xml" => Ok(ExportFormat::GraphMl),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(LorestoreError::validation(format!(
                "unknown export format '{}'",
                other
            ))),
        }
    }
}

/// Which entities to export. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFilter {
    pub kinds: Vec<EntityKind>,
    /// Entity must carry at least one of these tags
    pub tags: Vec<String>,
    pub updated_since: Option<DateTime<Utc>>,
}

impl ExportFilter {
    pub fn matches(&self, entity: &Entity) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&entity.kind))
            && (self.tags.is_empty() || self.tags.iter().any(|t| entity.tags.contains(t.trim())))
            && self.updated_since.map_or(true, |since| entity.updated_at >= since)
    }
}

/// Export entities accepted by `filter`
pub fn export(graph: &GraphIndex, format: ExportFormat, filter: &ExportFilter) -> Result<Vec<u8>> {
    export_with(graph, format, |e| filter.matches(e))
}

/// Export entities accepted by `keep`, plus the relationships between them
pub fn export_with<F>(graph: &GraphIndex, format: ExportFormat, keep: F) -> Result<Vec<u8>>
where
    F: Fn(&Entity) -> bool,
{
    let entities: Vec<Entity> = graph.entities().filter(|e| keep(e)).cloned().collect();
    let ids: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    let relationships: Vec<Relationship> = graph
        .relationships()
        .filter(|r| ids.contains(r.source_id.as_str()) && ids.contains(r.target_id.as_str()))
        .cloned()
        .collect();

    let snapshot = Snapshot::new(entities, relationships)?;
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(&snapshot)?),
        ExportFormat::GraphMl => to_graphml(&snapshot).map(String::into_bytes),
        ExportFormat::Csv => to_csv(&snapshot).map(String::into_bytes),
    }
}

fn to_graphml(snapshot: &Snapshot) -> Result<String> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
    for (id, scope, kind) in [
        ("kind", "node", "string"),
        ("tags", "node", "string"),
        ("type", "edge", "string"),
        ("weight", "edge", "double"),
        ("properties", "all", "string"),
        ("createdAt", "all", "string"),
        ("timestamp", "all", "string"),
    ] {
        let _ = writeln!(
            xml,
            "  <key id=\"{id}\" for=\"{scope}\" attr.name=\"{id}\" attr.type=\"{kind}\"/>"
        );
    }
    xml.push_str("  <graph id=\"lorestore\" edgedefault=\"directed\">\n");

    for entity in &snapshot.entities {
        let tags: Vec<&str> = entity.tags.iter().map(String::as_str).collect();
        let _ = writeln!(xml, "    <node id=\"{}\">", escape_xml(&entity.id));
        push_data(&mut xml, "kind", entity.kind.as_str());
        push_data(&mut xml, "tags", &tags.join(";"));
        push_data(&mut xml, "properties", &serde_json::to_string(&entity.properties)?);
        push_data(&mut xml, "createdAt", &entity.created_at.to_rfc3339());
        push_data(&mut xml, "timestamp", &entity.updated_at.to_rfc3339());
        xml.push_str("    </node>\n");
    }

    for (i, relationship) in snapshot.relationships.iter().enumerate() {
        let _ = writeln!(
            xml,
            "    <edge id=\"e{}\" source=\"{}\" target=\"{}\">",
            i,
            escape_xml(&relationship.source_id),
            escape_xml(&relationship.target_id)
        );
        push_data(&mut xml, "type", relationship.relation.as_str());
        push_data(&mut xml, "weight", &relationship.weight.to_string());
        push_data(&mut xml, "properties", &serde_json::to_string(&relationship.properties)?);
        push_data(&mut xml, "createdAt", &relationship.created_at.to_rfc3339());
        push_data(&mut xml, "timestamp", &relationship.updated_at.to_rfc3339());
        xml.push_str("    </edge>\n");
    }

    xml.push_str("  </graph>\n</graphml>\n");
    Ok(xml)
}

fn push_data(xml: &mut String, key: &str, value: &str) {
    let _ = writeln!(xml, "      <data key=\"{}\">{}</data>", key, escape_xml(value));
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Two sections, nodes then edges, separated by a blank line
fn to_csv(snapshot: &Snapshot) -> Result<String> {
    let mut csv = String::new();

    csv.push_str("# nodes\n");
    csv.push_str("id,kind,tags,created_at,updated_at,properties\n");
    for entity in &snapshot.entities {
        let tags: Vec<&str> = entity.tags.iter().map(String::as_str).collect();
        let _ = writeln!(
            csv,
            "{},{},{},{},{},{}",
            escape_csv(&entity.id),
            entity.kind,
            escape_csv(&tags.join(";")),
            entity.created_at.to_rfc3339(),
            entity.updated_at.to_rfc3339(),
            escape_csv(&serde_json::to_string(&entity.properties)?)
        );
    }

    csv.push_str("\n# edges\n");
    csv.push_str("source,target,type,weight,created_at,updated_at,properties\n");
    for relationship in &snapshot.relationships {
        let _ = writeln!(
            csv,
            "{},{},{},{},{},{},{}",
            escape_csv(&relationship.source_id),
            escape_csv(&relationship.target_id),
            relationship.relation,
            relationship.weight,
            relationship.created_at.to_rfc3339(),
            relationship.updated_at.to_rfc3339(),
            escape_csv(&serde_json::to_string(&relationship.properties)?)
        );
    }

    Ok(csv)
}

fn escape_csv(s: &str) -> String {
    if s.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Union by id and triple, last write wins by `updated_at`
    #[default]
    Merge,
    /// Discard the current graph
    Replace,
}

impl FromStr for ImportMode {
    type Err = LorestoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "merge" => Ok(ImportMode::Merge),
            "replace" => Ok(ImportMode::Replace),
            other => Err(LorestoreError::validation(format!(
                "unknown import mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub mode: ImportMode,
    /// Compute the summary without writing
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub mode: ImportMode,
    pub dry_run: bool,
    pub entities_added: usize,
    pub entities_updated: usize,
    pub entities_unchanged: usize,
    pub relationships_added: usize,
    pub relationships_updated: usize,
    pub relationships_unchanged: usize,
    /// Entities whose kind differs from the stored entity
    pub skipped_kind_conflicts: usize,
    /// Relationships with an endpoint absent after the import or skipped for
    /// a kind conflict
    pub skipped_relationships: usize,
}

/// Records an import would write, and its summary
#[derive(Debug, Clone, PartialEq)]
pub struct ImportPlan {
    pub summary: ImportSummary,
    /// Merge: records to append. Replace: the complete new log.
    pub records: Vec<LogRecord>,
}

/// Decide what importing `snapshot` into `graph` does, without mutating
pub fn plan_import(graph: &GraphIndex, snapshot: &Snapshot, options: ImportOptions) -> ImportPlan {
    let mut summary = ImportSummary {
        mode: options.mode,
        dry_run: options.dry_run,
        ..ImportSummary::default()
    };
    let mut records = Vec::new();

    match options.mode {
        ImportMode::Replace => {
            let ids: HashSet<&str> = snapshot.entities.iter().map(|e| e.id.as_str()).collect();
            records.extend(snapshot.entities.iter().cloned().map(LogRecord::Entity));
            summary.entities_added = snapshot.entities.len();
            for relationship in &snapshot.relationships {
                if ids.contains(relationship.source_id.as_str())
                    && ids.contains(relationship.target_id.as_str())
                {
                    records.push(LogRecord::Relationship(relationship.clone()));
                    summary.relationships_added += 1;
                } else {
                    summary.skipped_relationships += 1;
                }
            }
        }
        ImportMode::Merge => {
            let mut incoming_ids: HashSet<&str> = HashSet::new();
            let mut conflicted: HashSet<&str> = HashSet::new();
            for entity in &snapshot.entities {
                match graph.get_entity(&entity.id) {
                    None => {
                        incoming_ids.insert(&entity.id);
                        summary.entities_added += 1;
                        records.push(LogRecord::Entity(entity.clone()));
                    }
                    Some(existing) => match merge_entities(existing, entity) {
                        Err(_) => {
                            conflicted.insert(&entity.id);
                            summary.skipped_kind_conflicts += 1;
                        }
                        Ok(merged) if &merged == existing => summary.entities_unchanged += 1,
                        Ok(merged) => {
                            summary.entities_updated += 1;
                            records.push(LogRecord::Entity(merged));
                        }
                    },
                }
            }

            let exists = |id: &str| {
                !conflicted.contains(id) && (graph.contains(id) || incoming_ids.contains(id))
            };
            for relationship in &snapshot.relationships {
                if !exists(&relationship.source_id) || !exists(&relationship.target_id) {
                    summary.skipped_relationships += 1;
                    continue;
                }
                let key: RelationshipKey = relationship.key();
                match graph.get_relationship(&key) {
                    None => {
                        summary.relationships_added += 1;
                        records.push(LogRecord::Relationship(relationship.clone()));
                    }
                    Some(existing) => {
                        let merged = merge_relationships(existing, relationship);
                        if &merged == existing {
                            summary.relationships_unchanged += 1;
                        } else {
                            summary.relationships_updated += 1;
                            records.push(LogRecord::Relationship(merged));
                        }
                    }
                }
            }
        }
    }

    ImportPlan { summary, records }
}

/// Union of two versions of an entity. The newer `updated_at` wins
/// conflicting properties, tags are unioned, `created_at` is the earliest.
fn merge_entities(existing: &Entity, incoming: &Entity) -> Result<Entity> {
    let (older, newer) = if incoming.updated_at > existing.updated_at {
        (existing, incoming)
    } else {
        (incoming, existing)
    };
    let mut merged = older.merged_with(newer)?;
    merged.created_at = existing.created_at.min(incoming.created_at);
    Ok(merged)
}

fn merge_relationships(existing: &Relationship, incoming: &Relationship) -> Relationship {
    let (older, newer) = if incoming.updated_at > existing.updated_at {
        (existing, incoming)
    } else {
        (incoming, existing)
    };
    let mut merged = older.merged_with(newer);
    merged.created_at = existing.created_at.min(incoming.created_at);
    merged
}
