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

//! Project similarity scoring

use crate::graph::GraphIndex;
use lorestore_core::{Entity, EntityId, EntityKind, PropertyValue};
use serde::{Deserialize, Serialize};

/// Feature weights for project similarity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub language_weight: f64,
    pub framework_weight: f64,
    pub file_count_weight: f64,
    pub documentation_type_weight: f64,
    /// Maximum relative difference for file counts to count as similar
    pub file_count_tolerance: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            language_weight: 0.3,
            framework_weight: 0.3,
            file_count_weight: 0.2,
            documentation_type_weight: 0.2,
            file_count_tolerance: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarEntity {
    pub id: EntityId,
    pub score: f64,
}

/// Score two projects in [0, 1]. A feature missing on either side never matches.
pub fn project_similarity(a: &Entity, b: &Entity, config: &SimilarityConfig) -> f64 {
    let mut score = 0.0;

    if same_text(a, b, "language") {
        score += config.language_weight;
    }
    if same_text(a, b, "framework") {
        score += config.framework_weight;
    }
    if let (Some(x), Some(y)) = (count(a, "file_count"), count(b, "file_count")) {
        let largest = x.abs().max(y.abs());
        let relative = if largest == 0.0 {
            0.0
        } else {
            (x - y).abs() / largest
        };
        if relative <= config.file_count_tolerance {
            score += config.file_count_weight;
        }
    }
    if same_text(a, b, "documentation_type") {
        score += config.documentation_type_weight;
    }

    score.clamp(0.0, 1.0)
}

/// Rank every other project by similarity to `id`: score desc, then id.
/// Unknown ids give an empty result.
pub fn find_similar(
    graph: &GraphIndex,
    id: &str,
    min_similarity: f64,
    max_results: usize,
    config: &SimilarityConfig,
) -> Vec<SimilarEntity> {
    let Some(query) = graph.get_entity(id) else {
        return Vec::new();
    };

    let mut results: Vec<SimilarEntity> = graph
        .entities()
        .filter(|e| e.kind == EntityKind::Project && e.id != query.id)
        .map(|e| SimilarEntity {
            id: e.id.clone(),
            score: project_similarity(query, e, config),
        })
        .filter(|s| s.score >= min_similarity)
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    results.truncate(max_results);
    results
}

fn normalized(entity: &Entity, key: &str) -> Option<String> {
    entity
        .text_property(key)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

fn same_text(a: &Entity, b: &Entity, key: &str) -> bool {
    match (normalized(a, key), normalized(b, key)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn count(entity: &Entity, key: &str) -> Option<f64> {
    match entity.property(key)? {
        PropertyValue::Number(n) if n.is_finite() => Some(*n),
        PropertyValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}
