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

//! Read-only aggregations over the graph
//!
//! Every function recomputes from the index on each call.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use lorestore_core::{EntityId, EntityKind, RelationType};
use lorestore_index::{degree_ranking, GraphIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Tag that marks an entity as a critical item in health reports
pub const CRITICAL_TAG: &str = "critical";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Day,
    /// ISO weeks starting on Monday
    Week,
    Month,
}

impl Granularity {
    fn bucket(&self, at: DateTime<Utc>) -> NaiveDate {
        let date = at.date_naive();
        match self {
            Granularity::Day => date,
            Granularity::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Granularity::Month => date.with_day(1).unwrap_or(date),
        }
    }
}

impl FromStr for Granularity {
    type Err = lorestore_core::LorestoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(lorestore_core::LorestoreError::validation(format!(
                "unknown granularity '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    /// First day of the bucket
    pub start: NaiveDate,
    pub count: usize,
}

/// Entities created per bucket, ascending
pub fn activity_timeline(
    graph: &GraphIndex,
    granularity: Granularity,
    kind: Option<EntityKind>,
) -> Vec<TimelineBucket> {
    let mut buckets: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for entity in graph.entities().filter(|e| kind.map_or(true, |k| e.kind == k)) {
        *buckets.entry(granularity.bucket(entity.created_at)).or_default() += 1;
    }
    buckets
        .into_iter()
        .map(|(start, count)| TimelineBucket { start, count })
        .collect()
}

pub fn kind_distribution(graph: &GraphIndex) -> BTreeMap<EntityKind, usize> {
    let mut counts = BTreeMap::new();
    for entity in graph.entities() {
        *counts.entry(entity.kind).or_default() += 1;
    }
    counts
}

pub fn relation_distribution(graph: &GraphIndex) -> BTreeMap<RelationType, usize> {
    let mut counts = BTreeMap::new();
    for relationship in graph.relationships() {
        *counts.entry(relationship.relation).or_default() += 1;
    }
    counts
}

/// Most used tags, count desc then tag
pub fn tag_distribution(graph: &GraphIndex, limit: usize) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for tag in graph.entities().flat_map(|e| e.tags.iter()) {
        *counts.entry(tag.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(tag, count)| (tag.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// 0 to 100
    pub score: u8,
    /// Fraction of entities updated within the recency window
    pub recency: f64,
    pub critical_items: usize,
    /// Entities plus relationships
    pub total_items: usize,
}

/// `round(100 · (0.5 · recency + 0.5 · (1 − critical / total)))`
///
/// Critical items are `outdated-for` edges, failed `deployed-with` edges and
/// entities tagged `critical`.
pub fn health_score(graph: &GraphIndex, now: DateTime<Utc>, recency_window: Duration) -> HealthReport {
    let entity_count = graph.entity_count();
    let recency = if entity_count == 0 {
        1.0
    } else {
        let cutoff = now - recency_window;
        let recent = graph.entities().filter(|e| e.updated_at >= cutoff).count();
        recent as f64 / entity_count as f64
    };

    let critical_edges = graph
        .relationships()
        .filter(|r| match r.relation {
            RelationType::OutdatedFor => true,
            RelationType::DeployedWith => r.success() == Some(false),
            _ => false,
        })
        .count();
    let critical_entities = graph
        .entities()
        .filter(|e| e.tags.contains(CRITICAL_TAG))
        .count();
    let critical_items = critical_edges + critical_entities;
    let total_items = entity_count + graph.relationship_count();

    let critical_share = if total_items == 0 {
        0.0
    } else {
        (critical_items as f64 / total_items as f64).min(1.0)
    };
    let score = (100.0 * (0.5 * recency + 0.5 * (1.0 - critical_share))).round();

    HealthReport {
        score: score.clamp(0.0, 100.0) as u8,
        recency,
        critical_items,
        total_items,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphStatistics {
    pub node_count: usize,
    pub edge_count: usize,
    /// Directed density, E / (N · (N − 1))
    pub density: f64,
    /// Mean total degree, 2E / N
    pub average_degree: f64,
    pub component_count: usize,
    pub kind_distribution: BTreeMap<EntityKind, usize>,
    pub relation_distribution: BTreeMap<RelationType, usize>,
    pub most_connected: Vec<(EntityId, usize)>,
    pub pattern_count: usize,
}

pub fn statistics(graph: &GraphIndex, pattern_count: usize, top: usize) -> GraphStatistics {
    let nodes = graph.entity_count();
    let edges = graph.relationship_count();
    let density = if nodes > 1 {
        edges as f64 / (nodes as f64 * (nodes as f64 - 1.0))
    } else {
        0.0
    };
    let average_degree = if nodes > 0 {
        2.0 * edges as f64 / nodes as f64
    } else {
        0.0
    };

    GraphStatistics {
        node_count: nodes,
        edge_count: edges,
        density,
        average_degree,
        component_count: graph.connected_components().len(),
        kind_distribution: kind_distribution(graph),
        relation_distribution: relation_distribution(graph),
        most_connected: degree_ranking(graph, top)
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .collect(),
        pattern_count,
    }
}
