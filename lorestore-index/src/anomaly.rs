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

//! Statistical anomaly detection over entity properties
//!
//! Numeric features are flagged by z-score against the population standard
//! deviation of the entities carrying the feature. Categorical features are
//! flagged when their value is rare among those entities.
//!
//! Each flag contributes to the anomaly score: |z| / threshold for numeric
//! features, rare_frequency / frequency for categorical ones. Both are above 1
//! for any flagged feature.

use crate::graph::GraphIndex;
use lorestore_core::{Entity, EntityId, EntityKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyOptions {
    /// Restrict the population to one kind (all entities when `None`)
    pub kind: Option<EntityKind>,
    pub numeric_features: Vec<String>,
    pub categorical_features: Vec<String>,
    pub std_dev_threshold: f64,
    pub rare_frequency: f64,
    /// Features carried by fewer entities are skipped
    pub min_population: usize,
}

impl Default for AnomalyOptions {
    fn default() -> Self {
        Self {
            kind: Some(EntityKind::Project),
            numeric_features: vec!["file_count".to_string()],
            categorical_features: vec!["language".to_string(), "framework".to_string()],
            std_dev_threshold: 2.0,
            rare_frequency: 0.1,
            min_population: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub entity_id: EntityId,
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Flag entities whose features deviate from their population.
/// Sorted by score descending, then id.
pub fn detect_anomalies(graph: &GraphIndex, options: &AnomalyOptions) -> Vec<Anomaly> {
    let mut population: Vec<&Entity> = graph
        .entities()
        .filter(|e| options.kind.map_or(true, |k| e.kind == k))
        .collect();
    // Id order fixes the float summation order
    population.sort_by(|a, b| a.id.cmp(&b.id));

    let mut flagged: BTreeMap<&str, (f64, Vec<String>)> = BTreeMap::new();

    for feature in &options.numeric_features {
        let values: Vec<(&str, f64)> = population
            .iter()
            .filter_map(|e| {
                e.number_property(feature)
                    .filter(|v| v.is_finite())
                    .map(|v| (e.id.as_str(), v))
            })
            .collect();
        if values.len() < options.min_population.max(1) {
            continue;
        }

        let (mean, std_dev) = calculate_stats(values.iter().map(|(_, v)| *v));
        if std_dev == 0.0 {
            continue;
        }

        for (id, value) in values {
            let z = (value - mean) / std_dev;
            if z.abs() > options.std_dev_threshold {
                let entry = flagged.entry(id).or_default();
                entry.0 += z.abs() / options.std_dev_threshold;
                entry.1.push(format!(
                    "{}={} is {:.1}σ from the mean of {:.1}",
                    feature, value, z.abs(), mean
                ));
            }
        }
    }

    for feature in &options.categorical_features {
        let values: Vec<(&str, String)> = population
            .iter()
            .filter_map(|e| {
                e.property(feature)
                    .and_then(|v| v.scalar_string())
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .map(|s| (e.id.as_str(), s))
            })
            .collect();
        if values.len() < options.min_population.max(1) {
            continue;
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, value) in &values {
            *counts.entry(value.as_str()).or_default() += 1;
        }
        let carriers = values.len() as f64;

        for (id, value) in &values {
            let frequency = counts.get(value.as_str()).copied().unwrap_or(0) as f64 / carriers;
            if frequency < options.rare_frequency {
                let entry = flagged.entry(*id).or_default();
                entry.0 += options.rare_frequency / frequency;
                entry.1.push(format!(
                    "{}={} appears in {:.0}% of {} entities",
                    feature,
                    value,
                    frequency * 100.0,
                    values.len()
                ));
            }
        }
    }

    let mut anomalies: Vec<Anomaly> = flagged
        .into_iter()
        .map(|(id, (score, reasons))| Anomaly {
            entity_id: id.to_string(),
            score,
            reasons,
        })
        .collect();
    anomalies.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    anomalies
}

/// Mean and population standard deviation
fn calculate_stats(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let count = values.clone().count();
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f64>() / count as f64;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorestore_core::LogRecord;

    fn projects(specs: &[(&str, &str, u64)]) -> GraphIndex {
        let records: Vec<LogRecord> = specs
            .iter()
            .map(|(id, language, files)| {
                Entity::new(*id, EntityKind::Project)
                    .with_property("language", *language)
                    .with_property("file_count", *files)
                    .into()
            })
            .collect();
        GraphIndex::build(&records).0
    }

    #[test]
    fn test_numeric_outlier() {
        let mut specs: Vec<(String, &str, u64)> =
            (0..10).map(|i| (format!("p{}", i), "rust", 100 + i)).collect();
        specs.push(("huge".to_string(), "rust", 10_000));
        let borrowed: Vec<(&str, &str, u64)> =
            specs.iter().map(|(id, l, f)| (id.as_str(), *l, *f)).collect();
        let graph = projects(&borrowed);

        let anomalies = detect_anomalies(&graph, &AnomalyOptions::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].entity_id, "huge");
        assert!(anomalies[0].score > 1.0);
        assert!(anomalies[0].reasons[0].starts_with("file_count="));
    }

    #[test]
    fn test_rare_category() {
        let mut specs: Vec<(String, &str, u64)> =
            (0..11).map(|i| (format!("p{:02}", i), "typescript", 100)).collect();
        specs.push(("odd".to_string(), "cobol", 100));
        let borrowed: Vec<(&str, &str, u64)> =
            specs.iter().map(|(id, l, f)| (id.as_str(), *l, *f)).collect();
        let graph = projects(&borrowed);

        let anomalies = detect_anomalies(&graph, &AnomalyOptions::default());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].entity_id, "odd");
        assert!(anomalies[0].reasons[0].contains("cobol"));
    }

    #[test]
    fn test_small_population_is_skipped() {
        let graph = projects(&[("a", "rust", 1), ("b", "go", 1), ("c", "c", 100_000)]);
        assert!(detect_anomalies(&graph, &AnomalyOptions::default()).is_empty());
    }

    #[test]
    fn test_uniform_values_have_no_outliers() {
        let graph = projects(&[
            ("a", "rust", 5),
            ("b", "rust", 5),
            ("c", "rust", 5),
            ("d", "rust", 5),
            ("e", "rust", 5),
        ]);
        assert!(detect_anomalies(&graph, &AnomalyOptions::default()).is_empty());
    }

    #[test]
    fn test_scores_do_not_depend_on_insertion_order() {
        let specs: Vec<(String, &str, u64)> = (0..12)
            .map(|i| (format!("p{:02}", i), "rust", 3 + i * i * 7))
            .chain([("spike".to_string(), "rust", 25_000)])
            .collect();
        let forward: Vec<(&str, &str, u64)> =
            specs.iter().map(|(id, l, f)| (id.as_str(), *l, *f)).collect();
        let backward: Vec<(&str, &str, u64)> = forward.iter().rev().copied().collect();

        let first = detect_anomalies(&projects(&forward), &AnomalyOptions::default());
        let second = detect_anomalies(&projects(&backward), &AnomalyOptions::default());
        assert!(!first.is_empty());
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.entity_id, b.entity_id);
            assert_eq!(a.score.to_bits(), b.score.to_bits());
            assert_eq!(a.reasons, b.reasons);
        }
    }
}
