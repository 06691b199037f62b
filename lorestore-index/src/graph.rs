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

//! In-memory Graph Index
//!
//! The materialized view of the log. Entities are keyed by id, relationships
//! by their `(source, target, type)` triple, and adjacency is kept in both
//! directions so traversal in either direction is a lookup:
//! - Entity lookup by ID
//! - Relationship queries (outgoing, incoming, bidirectional)
//! - Cascading removal for retention cleanup
//!
//! Adjacency sets are `BTreeSet`s so neighbor iteration order only depends on
//! the graph contents, never on insertion history.

use lorestore_core::{
    Entity, EntityId, LogRecord, LorestoreError, RelationType, Relationship, RelationshipKey,
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Edge direction relative to an entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

impl Direction {
    fn includes_outgoing(self) -> bool {
        matches!(self, Direction::Outgoing | Direction::Both)
    }

    fn includes_incoming(self) -> bool {
        matches!(self, Direction::Incoming | Direction::Both)
    }
}

/// An adjacent entity reached over one relationship
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: EntityId,
    pub relation: RelationType,
    pub weight: f64,
    /// Outgoing when the queried entity is the source
    pub direction: Direction,
}

/// Degree counts for a single entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Degree {
    pub incoming: usize,
    pub outgoing: usize,
}

impl Degree {
    pub fn total(&self) -> usize {
        self.incoming + self.outgoing
    }
}

/// What a cold-start build had to skip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub entities: usize,
    pub relationships: usize,
    /// Relationship records whose endpoints were never remembered
    pub skipped_relationships: usize,
    /// Entity records that tried to change an existing entity's kind
    pub rejected_entities: usize,
}

/// Knowledge graph index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphIndex {
    entities: HashMap<EntityId, Entity>,
    relationships: HashMap<RelationshipKey, Relationship>,
    outgoing: HashMap<EntityId, BTreeSet<RelationshipKey>>,
    incoming: HashMap<EntityId, BTreeSet<RelationshipKey>>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cold start: replay records in log order, latest record per identity wins.
    pub fn build<'a, I>(records: I) -> (GraphIndex, BuildReport)
    where
        I: IntoIterator<Item = &'a LogRecord>,
    {
        let mut index = GraphIndex::new();
        let mut report = BuildReport::default();

        for record in records {
            match index.apply(record) {
                Ok(()) => {}
                Err(e) => {
                    match record {
                        LogRecord::Entity(_) => report.rejected_entities += 1,
                        LogRecord::Relationship(_) => report.skipped_relationships += 1,
                    }
                    warn!(error = %e, "Skipping record during index build");
                }
            }
        }

        report.entities = index.entity_count();
        report.relationships = index.relationship_count();
        debug!(
            entities = report.entities,
            relationships = report.relationships,
            skipped = report.skipped_relationships,
            "Built graph index"
        );
        (index, report)
    }

    /// Apply one fully-specified record. Validation happens before any
    /// mutation, so a failed apply leaves the index untouched.
    pub fn apply(&mut self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Entity(entity) => {
                self.check_entity(entity)?;
                self.entities.insert(entity.id.clone(), entity.clone());
            }
            LogRecord::Relationship(relationship) => {
                self.check_relationship(relationship)?;
                let key = relationship.key();
                self.outgoing
                    .entry(key.source_id.clone())
                    .or_default()
                    .insert(key.clone());
                self.incoming
                    .entry(key.target_id.clone())
                    .or_default()
                    .insert(key.clone());
                self.relationships.insert(key, relationship.clone());
            }
        }
        Ok(())
    }

    /// Validate an entity against the current state without mutating
    pub fn check_entity(&self, entity: &Entity) -> Result<()> {
        entity.validate()?;
        if let Some(existing) = self.entities.get(&entity.id) {
            if existing.kind != entity.kind {
                return Err(LorestoreError::validation(format!(
                    "entity '{}' is a {} and cannot become a {}",
                    entity.id, existing.kind, entity.kind
                )));
            }
        }
        Ok(())
    }

    /// Validate a relationship against the current state without mutating
    pub fn check_relationship(&self, relationship: &Relationship) -> Result<()> {
        relationship.validate()?;
        for endpoint in [&relationship.source_id, &relationship.target_id] {
            if !self.entities.contains_key(endpoint) {
                return Err(LorestoreError::not_found(format!(
                    "entity '{}' referenced by {}",
                    endpoint,
                    relationship.key()
                )));
            }
        }
        Ok(())
    }

    pub fn get_entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn get_relationship(&self, key: &RelationshipKey) -> Option<&Relationship> {
        self.relationships.get(key)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterate entities (unordered)
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Iterate relationships (unordered)
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    /// Entity ids in ascending order
    pub fn sorted_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Relationships touching `id`, plus the entity at the other end.
    /// Outgoing edges come first, each side in key order.
    pub fn adjacent<'a>(
        &'a self,
        id: &str,
        direction: Direction,
    ) -> impl Iterator<Item = (&'a str, &'a Relationship, Direction)> + 'a {
        let outgoing = if direction.includes_outgoing() {
            self.outgoing.get(id)
        } else {
            None
        };
        let incoming = if direction.includes_incoming() {
            self.incoming.get(id)
        } else {
            None
        };

        let out_iter = outgoing.into_iter().flatten().filter_map(move |key| {
            self.relationships
                .get(key)
                .map(|r| (r.target_id.as_str(), r, Direction::Outgoing))
        });
        let in_iter = incoming.into_iter().flatten().filter_map(move |key| {
            self.relationships
                .get(key)
                .map(|r| (r.source_id.as_str(), r, Direction::Incoming))
        });
        out_iter.chain(in_iter)
    }

    pub fn neighbors(
        &self,
        id: &str,
        direction: Direction,
        relation: Option<RelationType>,
    ) -> Vec<Neighbor> {
        self.adjacent(id, direction)
            .filter(|(_, r, _)| relation.map_or(true, |wanted| r.relation == wanted))
            .map(|(other, r, dir)| Neighbor {
                id: other.to_string(),
                relation: r.relation,
                weight: r.weight,
                direction: dir,
            })
            .collect()
    }

    /// All relationships where `id` is source or target
    pub fn relationships_of(&self, id: &str) -> Vec<&Relationship> {
        let mut seen = HashSet::new();
        self.adjacent(id, Direction::Both)
            .filter(|(_, r, _)| seen.insert(r.key()))
            .map(|(_, r, _)| r)
            .collect()
    }

    pub fn degree(&self, id: &str) -> Degree {
        Degree {
            incoming: self.incoming.get(id).map_or(0, BTreeSet::len),
            outgoing: self.outgoing.get(id).map_or(0, BTreeSet::len),
        }
    }

    /// Distinct entities adjacent in either direction, ascending, excluding `id`
    pub fn undirected_neighbors(&self, id: &str) -> BTreeSet<&str> {
        self.adjacent(id, Direction::Both)
            .map(|(other, _, _)| other)
            .filter(|other| *other != id)
            .collect()
    }

    /// Remove an entity and every relationship touching it
    pub fn remove_entity(&mut self, id: &str) -> Option<(Entity, Vec<Relationship>)> {
        let entity = self.entities.remove(id)?;

        let mut keys: BTreeSet<RelationshipKey> = BTreeSet::new();
        if let Some(out) = self.outgoing.remove(id) {
            keys.extend(out);
        }
        if let Some(inc) = self.incoming.remove(id) {
            keys.extend(inc);
        }

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(relationship) = self.remove_relationship(&key) {
                removed.push(relationship);
            }
        }
        Some((entity, removed))
    }

    pub fn remove_relationship(&mut self, key: &RelationshipKey) -> Option<Relationship> {
        let relationship = self.relationships.remove(key)?;
        remove_from_set(&mut self.outgoing, &key.source_id, key);
        remove_from_set(&mut self.incoming, &key.target_id, key);
        Some(relationship)
    }

    /// Weakly connected components, each sorted, ordered by first member
    pub fn connected_components(&self) -> Vec<Vec<EntityId>> {
        let mut visited: HashSet<&str> = HashSet::with_capacity(self.entities.len());
        let mut components = Vec::new();

        for start in self.sorted_ids() {
            if !visited.insert(start) {
                continue;
            }
            let mut component = vec![start.to_string()];
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                for next in self.undirected_neighbors(node) {
                    if visited.insert(next) {
                        component.push(next.to_string());
                        queue.push_back(next);
                    }
                }
            }
            component.sort();
            components.push(component);
        }
        components
    }

    /// Every record needed to rebuild this index: entities then relationships,
    /// each sorted by identity.
    pub fn to_records(&self) -> Vec<LogRecord> {
        let mut entities: Vec<&Entity> = self.entities.values().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        let mut relationships: Vec<&Relationship> = self.relationships.values().collect();
        relationships.sort_by_key(|r| r.key());

        entities
            .into_iter()
            .map(|e| LogRecord::Entity(e.clone()))
            .chain(
                relationships
                    .into_iter()
                    .map(|r| LogRecord::Relationship(r.clone())),
            )
            .collect()
    }
}

fn remove_from_set(
    map: &mut HashMap<EntityId, BTreeSet<RelationshipKey>>,
    id: &str,
    key: &RelationshipKey,
) {
    if let Some(set) = map.get_mut(id) {
        set.remove(key);
        if set.is_empty() {
            map.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorestore_core::EntityKind;

    fn entity(id: &str, kind: EntityKind) -> LogRecord {
        Entity::new(id, kind).into()
    }

    fn edge(source: &str, target: &str, relation: RelationType) -> LogRecord {
        Relationship::new(source, target, relation).into()
    }

    fn sample() -> GraphIndex {
        let records = vec![
            entity("p1", EntityKind::Project),
            entity("rust", EntityKind::Technology),
            entity("doc", EntityKind::DocumentationSection),
            edge("p1", "rust", RelationType::UsesTechnology),
            edge("doc", "p1", RelationType::Documents),
        ];
        GraphIndex::build(&records).0
    }

    #[test]
    fn test_build_skips_dangling_relationships() {
        let records = vec![
            entity("a", EntityKind::Project),
            edge("a", "ghost", RelationType::DependsOn),
        ];
        let (index, report) = GraphIndex::build(&records);
        assert_eq!(report.entities, 1);
        assert_eq!(report.relationships, 0);
        assert_eq!(report.skipped_relationships, 1);
        assert_eq!(index.degree("a").total(), 0);
    }

    #[test]
    fn test_apply_rejects_kind_change_without_mutation() {
        let mut index = sample();
        let before = index.clone();
        let err = index.apply(&entity("p1", EntityKind::User)).unwrap_err();
        assert!(matches!(err, LorestoreError::Validation(_)));
        assert_eq!(index, before);
    }

    #[test]
    fn test_apply_rejects_missing_endpoint() {
        let mut index = sample();
        let before = index.clone();
        let err = index
            .apply(&edge("p1", "missing", RelationType::DependsOn))
            .unwrap_err();
        assert!(matches!(err, LorestoreError::NotFound(_)));
        assert_eq!(index, before);
    }

    #[test]
    fn test_neighbors_by_direction_and_type() {
        let index = sample();

        let out = index.neighbors("p1", Direction::Outgoing, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "rust");

        let inc = index.neighbors("p1", Direction::Incoming, None);
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].id, "doc");
        assert_eq!(inc[0].direction, Direction::Incoming);

        let docs = index.neighbors("p1", Direction::Both, Some(RelationType::Documents));
        assert_eq!(docs.len(), 1);
        assert!(index.neighbors("nobody", Direction::Both, None).is_empty());
    }

    #[test]
    fn test_reassertion_replaces_single_edge() {
        let mut index = sample();
        index
            .apply(&Relationship::new("p1", "rust", RelationType::UsesTechnology).with_weight(0.3).into())
            .unwrap();
        assert_eq!(index.relationship_count(), 2);
        let key = RelationshipKey::new("p1", "rust", RelationType::UsesTechnology);
        assert_eq!(index.get_relationship(&key).unwrap().weight, 0.3);
        assert_eq!(index.degree("p1"), Degree { incoming: 1, outgoing: 1 });
    }

    #[test]
    fn test_remove_entity_cascades() {
        let mut index = sample();
        let (removed, edges) = index.remove_entity("p1").unwrap();
        assert_eq!(removed.id, "p1");
        assert_eq!(edges.len(), 2);
        assert_eq!(index.relationship_count(), 0);
        assert_eq!(index.degree("rust").total(), 0);

        // Equivalent to an index built without p1 or its edges
        let rebuilt = GraphIndex::build(&[
            entity("rust", EntityKind::Technology),
            entity("doc", EntityKind::DocumentationSection),
        ])
        .0;
        let mut expected = rebuilt;
        for id in ["rust", "doc"] {
            let e = index.get_entity(id).unwrap().clone();
            expected.apply(&e.into()).unwrap();
        }
        assert_eq!(index, expected);
    }

    #[test]
    fn test_connected_components() {
        let mut index = sample();
        index.apply(&entity("lonely", EntityKind::User)).unwrap();
        let components = index.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec!["doc", "p1", "rust"]);
        assert_eq!(components[1], vec!["lonely"]);
    }
}
