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

//! Node centrality
//!
//! Closeness and betweenness are computed on the undirected, unweighted
//! subgraph reachable from the queried node:
//!
//! - closeness = (r − 1) / Σ d(v, u) over the r reachable nodes
//! - betweenness = Brandes dependency of v, normalized by the number of
//!   unordered pairs not involving v, ((n − 1)(n − 2) / 2)
//!
//! Both are bounded by a [`Budget`]. When the node cap cuts the subgraph, or
//! the deadline stops Brandes early, betweenness is extrapolated from the
//! sources processed so far and the result is flagged `truncated`.

use crate::budget::{Bounded, Budget};
use crate::graph::GraphIndex;
use lorestore_core::EntityId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentralityReport {
    pub entity_id: EntityId,
    pub in_degree: usize,
    pub out_degree: usize,
    pub degree: usize,
    pub closeness: f64,
    pub betweenness: f64,
    /// Size of the reachable subgraph the scores were computed on
    pub reachable: usize,
}

pub fn centrality(graph: &GraphIndex, id: &str, budget: &Budget) -> Option<Bounded<CentralityReport>> {
    graph.get_entity(id)?;
    let degree = graph.degree(id);

    let (nodes, adjacency, capped) = reachable_subgraph(graph, id, budget);
    let origin = 0;
    let n = nodes.len();

    let distances = bfs_distances(&adjacency, origin);
    let total_distance: usize = distances.iter().flatten().sum();
    let reached = distances.iter().filter(|d| d.is_some()).count();
    let closeness = if total_distance == 0 {
        0.0
    } else {
        (reached - 1) as f64 / total_distance as f64
    };

    let mut truncated = capped;
    let mut raw = 0.0;
    let mut processed = 0;
    for source in 0..n {
        if budget.deadline_passed() {
            truncated = true;
            break;
        }
        if source != origin {
            raw += dependency_on(&adjacency, source, origin);
        }
        processed += 1;
    }

    if processed > 0 && processed < n {
        raw *= n as f64 / processed as f64;
    }
    // Each unordered pair is counted from both ends
    let raw = raw / 2.0;
    let pairs = if n > 2 {
        ((n - 1) * (n - 2)) as f64 / 2.0
    } else {
        0.0
    };
    let betweenness = if pairs > 0.0 {
        (raw / pairs).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let report = CentralityReport {
        entity_id: id.to_string(),
        in_degree: degree.incoming,
        out_degree: degree.outgoing,
        degree: degree.total(),
        closeness,
        betweenness,
        reachable: n,
    };

    Some(if truncated {
        Bounded::partial(report)
    } else {
        Bounded::complete(report)
    })
}

/// Entities ranked by total degree, ties broken by id
pub fn degree_ranking(graph: &GraphIndex, limit: usize) -> Vec<(EntityId, usize)> {
    let mut ranked: Vec<(EntityId, usize)> = graph
        .sorted_ids()
        .into_iter()
        .map(|id| (id.to_string(), graph.degree(id).total()))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

/// BFS from `start` over the undirected graph, capped at `max_nodes`.
/// Returns node ids (start at index 0), local adjacency and whether the cap hit.
fn reachable_subgraph<'a>(
    graph: &'a GraphIndex,
    start: &'a str,
    budget: &Budget,
) -> (Vec<&'a str>, Vec<Vec<usize>>, bool) {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut nodes = vec![start];
    index.insert(start, 0);
    let mut capped = false;

    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for next in graph.undirected_neighbors(node) {
            if index.contains_key(next) {
                continue;
            }
            if budget.node_cap_reached(nodes.len()) {
                capped = true;
                continue;
            }
            index.insert(next, nodes.len());
            nodes.push(next);
            queue.push_back(next);
        }
    }

    let adjacency = nodes
        .iter()
        .map(|node| {
            graph
                .undirected_neighbors(node)
                .into_iter()
                .filter_map(|next| index.get(next).copied())
                .collect()
        })
        .collect();

    (nodes, adjacency, capped)
}

fn bfs_distances(adjacency: &[Vec<usize>], source: usize) -> Vec<Option<usize>> {
    let mut distances = vec![None; adjacency.len()];
    distances[source] = Some(0);
    let mut queue = VecDeque::from([source]);
    while let Some(node) = queue.pop_front() {
        let d = distances[node].unwrap_or(0);
        for &next in &adjacency[node] {
            if distances[next].is_none() {
                distances[next] = Some(d + 1);
                queue.push_back(next);
            }
        }
    }
    distances
}

/// Brandes single-source accumulation, returning δ_s(target)
fn dependency_on(adjacency: &[Vec<usize>], source: usize, target: usize) -> f64 {
    let n = adjacency.len();
    let mut sigma = vec![0.0f64; n];
    let mut distance: Vec<i64> = vec![-1; n];
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut order = Vec::with_capacity(n);

    sigma[source] = 1.0;
    distance[source] = 0;
    let mut queue = VecDeque::from([source]);

    while let Some(v) = queue.pop_front() {
        order.push(v);
        for &w in &adjacency[v] {
            if distance[w] < 0 {
                distance[w] = distance[v] + 1;
                queue.push_back(w);
            }
            if distance[w] == distance[v] + 1 {
                sigma[w] += sigma[v];
                predecessors[w].push(v);
            }
        }
    }

    let mut delta = vec![0.0f64; n];
    while let Some(w) = order.pop() {
        for &v in &predecessors[w] {
            delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
        }
    }
    delta[target]
}
