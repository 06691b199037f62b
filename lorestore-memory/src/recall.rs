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

//! Keyword recall over entities

use lorestore_core::{Entity, EntityKind, LorestoreError};
use lorestore_index::GraphIndex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const ID_WEIGHT: f64 = 3.0;
const TAG_WEIGHT: f64 = 2.0;
const PROPERTY_WEIGHT: f64 = 1.0;
const MAX_TERM_SCORE: f64 = ID_WEIGHT + TAG_WEIGHT + PROPERTY_WEIGHT;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    /// Most recently updated first
    Recent,
    /// Most recently created first
    Created,
    Id,
}

impl FromStr for SortBy {
    type Err = LorestoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "relevance" => Ok(SortBy::Relevance),
            "recent" | "updated" => Ok(SortBy::Recent),
            "created" => Ok(SortBy::Created),
            "id" => Ok(SortBy::Id),
            other => Err(LorestoreError::validation(format!("unknown sort order '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallOptions {
    pub kind: Option<EntityKind>,
    /// Unlimited when unset
    pub limit: Option<usize>,
    pub sort_by: SortBy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecallEntry {
    pub entity: Entity,
    /// Relevance in [0, 1]
    pub score: f64,
}

/// Find entities mentioning the query terms.
///
/// Each term scores 3 for a match in the id, 2 in a tag and 1 in a property
/// key or text value (case-insensitive substring). The score is the sum over
/// terms divided by its maximum. An empty query matches everything with score 1.
pub fn recall(graph: &GraphIndex, query: &str, options: &RecallOptions) -> Vec<RecallEntry> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();

    let mut entries: Vec<RecallEntry> = graph
        .entities()
        .filter(|e| options.kind.map_or(true, |k| e.kind == k))
        .filter_map(|e| {
            let score = if terms.is_empty() { 1.0 } else { relevance(e, &terms) };
            (score > 0.0).then(|| RecallEntry {
                entity: e.clone(),
                score,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        let (x, y) = (&a.entity, &b.entity);
        match options.sort_by {
            SortBy::Relevance => b
                .score
                .total_cmp(&a.score)
                .then_with(|| y.updated_at.cmp(&x.updated_at)),
            SortBy::Recent => y.updated_at.cmp(&x.updated_at),
            SortBy::Created => y.created_at.cmp(&x.created_at),
            SortBy::Id => std::cmp::Ordering::Equal,
        }
        .then_with(|| x.id.cmp(&y.id))
    });

    if let Some(limit) = options.limit {
        entries.truncate(limit);
    }
    entries
}

fn relevance(entity: &Entity, terms: &[String]) -> f64 {
    let id = entity.id.to_lowercase();
    let tags: Vec<String> = entity.tags.iter().map(|t| t.to_lowercase()).collect();
    let mut texts: Vec<&str> = Vec::new();
    for (key, value) in &entity.properties {
        texts.push(key.as_str());
        value.collect_text(&mut texts);
    }
    let texts: Vec<String> = texts.into_iter().map(str::to_lowercase).collect();

    let total: f64 = terms
        .iter()
        .map(|term| {
            let mut score = 0.0;
            if id.contains(term.as_str()) {
                score += ID_WEIGHT;
            }
            if tags.iter().any(|t| t.contains(term.as_str())) {
                score += TAG_WEIGHT;
            }
            if texts.iter().any(|t| t.contains(term.as_str())) {
                score += PROPERTY_WEIGHT;
            }
            score
        })
        .sum();

    total / (MAX_TERM_SCORE * terms.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorestore_core::LogRecord;

    fn graph() -> GraphIndex {
        let records: Vec<LogRecord> = vec![
            Entity::new("react", EntityKind::Technology)
                .with_property("name", "React")
                .with_tags(["frontend"])
                .into(),
            Entity::new("p1", EntityKind::Project)
                .with_property("framework", "react")
                .into(),
            Entity::new("p2", EntityKind::Project)
                .with_property("notes", serde_json::json!({"stack": ["vue", "vite"]}))
                .into(),
        ];
        GraphIndex::build(&records).0
    }

    #[test]
    fn test_relevance_ranking() {
        let results = recall(&graph(), "React", &RecallOptions::default());
        let ids: Vec<&str> = results.iter().map(|r| r.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["react", "p1"]);
        assert!(results[0].score > results[1].score);
        assert!(results.iter().all(|r| r.score > 0.0 && r.score <= 1.0));
    }

    #[test]
    fn test_nested_text_and_filters() {
        let g = graph();
        assert_eq!(recall(&g, "vite", &RecallOptions::default())[0].entity.id, "p2");

        let options = RecallOptions {
            kind: Some(EntityKind::Project),
            limit: Some(1),
            sort_by: SortBy::Id,
        };
        let results = recall(&g, "", &options);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity.id, "p1");

        assert!(recall(&g, "cobol", &RecallOptions::default()).is_empty());
    }
}
