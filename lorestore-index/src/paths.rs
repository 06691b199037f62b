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

//! Path queries
//!
//! Unknown or disconnected endpoints yield `None`; path queries never fail.

use crate::graph::{Direction, GraphIndex};
use lorestore_core::{EntityId, RelationType, Relationship};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{hash_map::Entry, BinaryHeap, HashMap, VecDeque};

/// Traversal constraints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathOptions {
    pub direction: Direction,
    /// Only traverse these relationship types (empty = all)
    #[serde(default)]
    pub relation_filter: Vec<RelationType>,
    /// Maximum number of hops
    pub max_depth: Option<usize>,
}

impl PathOptions {
    pub fn directed() -> Self {
        Self {
            direction: Direction::Outgoing,
            ..Self::default()
        }
    }

    pub fn with_relations(mut self, relations: impl IntoIterator<Item = RelationType>) -> Self {
        self.relation_filter = relations.into_iter().collect();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    fn allows(&self, relationship: &Relationship) -> bool {
        self.relation_filter.is_empty() || self.relation_filter.contains(&relationship.relation)
    }

    fn can_expand(&self, hops: usize) -> bool {
        self.max_depth.map_or(true, |max| hops < max)
    }
}

/// A path between two entities
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Path {
    /// Entity ids from start to end, inclusive
    pub ids: Vec<EntityId>,
    pub hops: usize,
    /// Hop count for BFS paths, Σ 1/weight for weighted paths
    pub cost: f64,
}

/// Fewest-hops path (BFS)
pub fn shortest_path(graph: &GraphIndex, from: &str, to: &str, options: &PathOptions) -> Option<Path> {
    if !graph.contains(from) || !graph.contains(to) {
        return None;
    }
    if from == to {
        return Some(single(from));
    }

    let mut parents: HashMap<&str, Option<&str>> = HashMap::new();
    let mut queue = VecDeque::new();
    parents.insert(from, None);
    queue.push_back((from, 0usize));

    while let Some((current, hops)) = queue.pop_front() {
        if current == to {
            let ids = reconstruct(&parents, to);
            let hops = ids.len() - 1;
            return Some(Path {
                ids,
                hops,
                cost: hops as f64,
            });
        }
        if !options.can_expand(hops) {
            continue;
        }

        for (next, relationship, _) in graph.adjacent(current, options.direction) {
            if !options.allows(relationship) {
                continue;
            }
            if let Entry::Vacant(e) = parents.entry(next) {
                e.insert(Some(current));
                queue.push_back((next, hops + 1));
            }
        }
    }

    None
}

/// Cheapest path where each edge costs `1 / weight` (Dijkstra).
/// Zero-weight edges are impassable.
pub fn weighted_path(graph: &GraphIndex, from: &str, to: &str, options: &PathOptions) -> Option<Path> {
    if !graph.contains(from) || !graph.contains(to) {
        return None;
    }
    if from == to {
        return Some(single(from));
    }

    let mut best: HashMap<&str, (f64, usize)> = HashMap::new();
    let mut parents: HashMap<&str, Option<&str>> = HashMap::new();
    let mut heap = BinaryHeap::new();

    best.insert(from, (0.0, 0));
    parents.insert(from, None);
    heap.push(Frontier {
        cost: 0.0,
        hops: 0,
        node: from,
    });

    while let Some(Frontier { cost, hops, node }) = heap.pop() {
        if node == to {
            return Some(Path {
                ids: reconstruct(&parents, to),
                hops,
                cost,
            });
        }
        if best.get(node).map_or(false, |(c, _)| cost > *c) {
            continue;
        }
        if !options.can_expand(hops) {
            continue;
        }

        for (next, relationship, _) in graph.adjacent(node, options.direction) {
            if !options.allows(relationship) || relationship.weight <= 0.0 {
                continue;
            }
            let next_cost = cost + 1.0 / relationship.weight;
            let improves = best.get(next).map_or(true, |(c, _)| next_cost < *c);
            if improves {
                best.insert(next, (next_cost, hops + 1));
                parents.insert(next, Some(node));
                heap.push(Frontier {
                    cost: next_cost,
                    hops: hops + 1,
                    node: next,
                });
            }
        }
    }

    None
}

pub fn path_exists(graph: &GraphIndex, from: &str, to: &str, options: &PathOptions) -> bool {
    shortest_path(graph, from, to, options).is_some()
}

fn single(id: &str) -> Path {
    Path {
        ids: vec![id.to_string()],
        hops: 0,
        cost: 0.0,
    }
}

fn reconstruct(parents: &HashMap<&str, Option<&str>>, to: &str) -> Vec<EntityId> {
    let mut path = Vec::new();
    let mut node = Some(to);
    while let Some(n) = node {
        path.push(n.to_string());
        node = parents.get(n).copied().flatten();
    }
    path.reverse();
    path
}

/// Min-heap entry ordered by cost, then hops, then id
struct Frontier<'a> {
    cost: f64,
    hops: usize,
    node: &'a str,
}

impl PartialEq for Frontier<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier<'_> {}

impl PartialOrd for Frontier<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.node.cmp(self.node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorestore_core::{Entity, EntityKind, LogRecord};

    fn graph(edges: &[(&str, &str, f64)]) -> GraphIndex {
        let mut records: Vec<LogRecord> = Vec::new();
        let mut ids: Vec<&str> = edges.iter().flat_map(|(a, b, _)| [*a, *b]).collect();
        ids.extend(["island"]);
        ids.sort();
        ids.dedup();
        for id in ids {
            records.push(Entity::new(id, EntityKind::Project).into());
        }
        for (a, b, w) in edges {
            records.push(
                lorestore_core::Relationship::new(*a, *b, RelationType::DependsOn)
                    .with_weight(*w)
                    .into(),
            );
        }
        GraphIndex::build(&records).0
    }

    #[test]
    fn test_bfs_finds_fewest_hops() {
        let g = graph(&[("a", "b", 1.0), ("b", "c", 1.0), ("a", "c", 0.1)]);
        let path = shortest_path(&g, "a", "c", &PathOptions::default()).unwrap();
        assert_eq!(path.ids, vec!["a", "c"]);
        assert_eq!(path.hops, 1);
    }

    #[test]
    fn test_weighted_prefers_strong_edges() {
        let g = graph(&[("a", "b", 1.0), ("b", "c", 1.0), ("a", "c", 0.1)]);
        let path = weighted_path(&g, "a", "c", &PathOptions::default()).unwrap();
        assert_eq!(path.ids, vec!["a", "b", "c"]);
        assert!((path.cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weight_is_impassable() {
        let g = graph(&[("a", "b", 0.0)]);
        assert!(weighted_path(&g, "a", "b", &PathOptions::default()).is_none());
        assert!(shortest_path(&g, "a", "b", &PathOptions::default()).is_some());
    }

    #[test]
    fn test_disconnected_and_unknown() {
        let g = graph(&[("a", "b", 1.0)]);
        let options = PathOptions::default();
        assert!(shortest_path(&g, "a", "island", &options).is_none());
        assert!(weighted_path(&g, "a", "island", &options).is_none());
        assert!(shortest_path(&g, "a", "nowhere", &options).is_none());
        assert_eq!(shortest_path(&g, "a", "a", &options).unwrap().hops, 0);
    }

    #[test]
    fn test_direction_and_depth() {
        let g = graph(&[("a", "b", 1.0), ("b", "c", 1.0)]);
        assert!(shortest_path(&g, "c", "a", &PathOptions::directed()).is_none());
        assert!(shortest_path(&g, "c", "a", &PathOptions::default()).is_some());
        assert!(!path_exists(&g, "a", "c", &PathOptions::default().with_max_depth(1)));
        assert!(path_exists(&g, "a", "c", &PathOptions::default().with_max_depth(2)));
    }

    #[test]
    fn test_relation_filter() {
        let g = graph(&[("a", "b", 1.0)]);
        let options = PathOptions::default().with_relations([RelationType::Documents]);
        assert!(shortest_path(&g, "a", "b", &options).is_none());
    }
}
