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

//! Leiden Community Detection
//!
//! Groups entities into communities over the undirected weighted projection
//! of the knowledge graph (parallel edges in either direction are summed,
//! self-loops ignored).
//!
//! ## Algorithm Overview
//!
//! 1. **Local Moving Phase**: Move nodes between communities to maximize modularity
//! 2. **Refinement Phase**: Split communities that are not internally connected
//! 3. **Repeat**: Until no move improves modularity by `min_improvement`
//!
//! Communities are not collapsed into super-nodes between rounds; every
//! round works on the original node set.
//!
//! ## Modularity
//!
//! Q = (1/2m) * Σij[Aij - γ(ki*kj)/(2m)] * δ(ci, cj)
//!
//! Where:
//! - Aij = edge weight between i and j
//! - ki, kj = weighted degree of nodes i, j
//! - m = total edge weight
//! - γ = resolution
//!
//! Node visiting order is shuffled with a seeded `StdRng`, so a fixed graph
//! and config always produce the same partition.
//!
//! Reference: Traag et al., "From Louvain to Leiden: guaranteeing well-connected communities"

use crate::graph::GraphIndex;
use lorestore_core::EntityId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_SEED: u64 = 0x6c6f_7265;

/// Leiden clustering configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeidenConfig {
    /// Resolution parameter (higher = more communities)
    pub resolution: f64,
    /// Maximum local-moving rounds
    pub max_iterations: usize,
    /// Minimum modularity improvement to continue
    pub min_improvement: f64,
    /// Random seed for the node visiting order
    pub seed: u64,
    /// Communities smaller than this are reported as unclustered
    pub min_cluster_size: usize,
}

impl Default for LeidenConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 100,
            min_improvement: 1e-6,
            seed: DEFAULT_SEED,
            min_cluster_size: 2,
        }
    }
}

/// A detected community
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: usize,
    /// Member ids, ascending
    pub members: Vec<EntityId>,
    /// Most common tags among members (or kinds when untagged)
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteringResult {
    /// Sorted by size descending, then first member
    pub clusters: Vec<Cluster>,
    /// Entities in communities below the minimum size, ascending
    pub unclustered: Vec<EntityId>,
    pub modularity: f64,
}

/// Leiden community detection algorithm
pub struct LeidenClustering {
    config: LeidenConfig,
}

/// Sparse undirected weighted graph over dense node indices
struct Projection<'a> {
    ids: Vec<&'a str>,
    adjacency: Vec<Vec<(usize, f64)>>,
    degrees: Vec<f64>,
    total_weight: f64,
}

impl<'a> Projection<'a> {
    fn from_graph(graph: &'a GraphIndex) -> Self {
        let ids = graph.sorted_ids();
        let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut weights: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); ids.len()];
        for relationship in graph.relationships() {
            if relationship.source_id == relationship.target_id || relationship.weight <= 0.0 {
                continue;
            }
            let (Some(&u), Some(&v)) = (
                position.get(relationship.source_id.as_str()),
                position.get(relationship.target_id.as_str()),
            ) else {
                continue;
            };
            *weights[u].entry(v).or_default() += relationship.weight;
            *weights[v].entry(u).or_default() += relationship.weight;
        }

        let adjacency: Vec<Vec<(usize, f64)>> = weights
            .into_iter()
            .map(|row| row.into_iter().collect())
            .collect();
        let degrees: Vec<f64> = adjacency
            .iter()
            .map(|row| row.iter().map(|(_, w)| w).sum())
            .collect();
        let total_weight = degrees.iter().sum::<f64>() / 2.0;

        Self {
            ids,
            adjacency,
            degrees,
            total_weight,
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

impl LeidenClustering {
    pub fn new() -> Self {
        Self {
            config: LeidenConfig::default(),
        }
    }

    pub fn with_config(config: LeidenConfig) -> Self {
        Self { config }
    }

    /// Run Leiden on the graph
    pub fn detect(&self, graph: &GraphIndex) -> ClusteringResult {
        let projection = Projection::from_graph(graph);
        let n = projection.len();

        // Each node starts in its own community
        let mut communities: Vec<usize> = (0..n).collect();

        if n > 0 && projection.total_weight > 0.0 {
            let mut rng = StdRng::seed_from_u64(self.config.seed);

            for iteration in 0..self.config.max_iterations {
                let old_modularity = self.modularity(&projection, &communities);

                let improved = self.local_moving_phase(&projection, &mut communities, &mut rng);
                self.refinement_phase(&projection, &mut communities);

                let new_modularity = self.modularity(&projection, &communities);
                tracing::debug!(
                    iteration,
                    modularity = new_modularity,
                    "Leiden iteration"
                );
                if !improved || new_modularity - old_modularity < self.config.min_improvement {
                    break;
                }
                communities = renumber(&communities);
            }
        }

        let modularity = self.modularity(&projection, &communities);
        self.collect(graph, &projection, &communities, modularity)
    }

    /// Move each node (in shuffled order) to the neighboring community with
    /// the largest modularity gain
    fn local_moving_phase(
        &self,
        projection: &Projection<'_>,
        communities: &mut [usize],
        rng: &mut StdRng,
    ) -> bool {
        let n = projection.len();
        let two_m = 2.0 * projection.total_weight;
        let resolution = self.config.resolution;

        // Σ degrees per community, indexed by community id
        let mut community_degree = vec![0.0; n.max(communities.iter().max().map_or(0, |m| m + 1))];
        for (node, &c) in communities.iter().enumerate() {
            community_degree[c] += projection.degrees[node];
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        let mut improved = false;
        for node in order {
            let current = communities[node];
            let k = projection.degrees[node];
            if k == 0.0 {
                continue;
            }

            let mut weight_to: BTreeMap<usize, f64> = BTreeMap::new();
            for &(neighbor, weight) in &projection.adjacency[node] {
                *weight_to.entry(communities[neighbor]).or_default() += weight;
            }

            community_degree[current] -= k;
            let gain = |community: usize, edge_weight: f64| {
                edge_weight - resolution * k * community_degree[community] / two_m
            };

            let mut best = current;
            let mut best_gain = gain(current, weight_to.get(&current).copied().unwrap_or(0.0));
            for (&community, &edge_weight) in &weight_to {
                if community == current {
                    continue;
                }
                let candidate = gain(community, edge_weight);
                if candidate > best_gain + 1e-12 {
                    best_gain = candidate;
                    best = community;
                }
            }

            community_degree[best] += k;
            if best != current {
                communities[node] = best;
                improved = true;
            }
        }

        improved
    }

    /// Split communities whose members are not connected through the
    /// community itself
    fn refinement_phase(&self, projection: &Projection<'_>, communities: &mut [usize]) {
        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (node, &c) in communities.iter().enumerate() {
            members.entry(c).or_default().push(node);
        }
        let mut next_id = communities.iter().max().map_or(0, |m| m + 1);

        for (community, nodes) in members {
            if nodes.len() <= 1 {
                continue;
            }

            let mut component_of: HashMap<usize, usize> = HashMap::new();
            let mut component = 0;
            for &start in &nodes {
                if component_of.contains_key(&start) {
                    continue;
                }
                component_of.insert(start, component);
                let mut stack = vec![start];
                while let Some(node) = stack.pop() {
                    for &(neighbor, _) in &projection.adjacency[node] {
                        if communities[neighbor] == community && !component_of.contains_key(&neighbor) {
                            component_of.insert(neighbor, component);
                            stack.push(neighbor);
                        }
                    }
                }
                component += 1;
            }

            if component <= 1 {
                continue;
            }
            // Component 0 keeps the id, the rest get fresh ones
            let base = next_id;
            next_id += component - 1;
            for &node in &nodes {
                let part = component_of.get(&node).copied().unwrap_or(0);
                if part > 0 {
                    communities[node] = base + part - 1;
                }
            }
        }
    }

    /// Q = Σ_c [ in_c / 2m − γ (tot_c / 2m)² ]
    fn modularity(&self, projection: &Projection<'_>, communities: &[usize]) -> f64 {
        if projection.total_weight == 0.0 {
            return 0.0;
        }
        let two_m = 2.0 * projection.total_weight;

        let mut internal: BTreeMap<usize, f64> = BTreeMap::new();
        let mut total: BTreeMap<usize, f64> = BTreeMap::new();
        for (node, &c) in communities.iter().enumerate() {
            *total.entry(c).or_default() += projection.degrees[node];
            for &(neighbor, weight) in &projection.adjacency[node] {
                if communities[neighbor] == c {
                    *internal.entry(c).or_default() += weight;
                }
            }
        }

        total
            .iter()
            .map(|(c, tot)| {
                let inside = internal.get(c).copied().unwrap_or(0.0);
                inside / two_m - self.config.resolution * (tot / two_m).powi(2)
            })
            .sum()
    }

    fn collect(
        &self,
        graph: &GraphIndex,
        projection: &Projection<'_>,
        communities: &[usize],
        modularity: f64,
    ) -> ClusteringResult {
        let mut groups: BTreeMap<usize, Vec<EntityId>> = BTreeMap::new();
        for (node, &c) in communities.iter().enumerate() {
            groups.entry(c).or_default().push(projection.ids[node].to_string());
        }

        let mut clusters = Vec::new();
        let mut unclustered = Vec::new();
        for (_, mut members) in groups {
            members.sort();
            if members.len() >= self.config.min_cluster_size.max(1) {
                let label = label_for(graph, &members);
                clusters.push(Cluster {
                    id: 0,
                    members,
                    label,
                });
            } else {
                unclustered.extend(members);
            }
        }

        clusters.sort_by(|a, b| {
            b.members
                .len()
                .cmp(&a.members.len())
                .then_with(|| a.members.first().cmp(&b.members.first()))
        });
        for (i, cluster) in clusters.iter_mut().enumerate() {
            cluster.id = i;
        }
        unclustered.sort();

        ClusteringResult {
            clusters,
            unclustered,
            modularity,
        }
    }
}

impl Default for LeidenClustering {
    fn default() -> Self {
        Self::new()
    }
}

/// Name a community from the three most frequent member tags, falling back
/// to member kinds
fn label_for(graph: &GraphIndex, members: &[EntityId]) -> String {
    let mut tag_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut kind_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for entity in members.iter().filter_map(|id| graph.get_entity(id)) {
        for tag in &entity.tags {
            *tag_counts.entry(tag.as_str()).or_default() += 1;
        }
        *kind_counts.entry(entity.kind.as_str()).or_default() += 1;
    }

    let source = if tag_counts.is_empty() { kind_counts } else { tag_counts };
    let mut ranked: Vec<(&str, usize)> = source.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(3)
        .map(|(name, _)| name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renumber communities to be contiguous, in node order
fn renumber(communities: &[usize]) -> Vec<usize> {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    communities
        .iter()
        .map(|&c| {
            let next = mapping.len();
            *mapping.entry(c).or_insert(next)
        })
        .collect()
}
