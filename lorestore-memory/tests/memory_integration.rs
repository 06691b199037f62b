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

//! End-to-end tests for the knowledge memory

use chrono::{Duration, Utc};
use lorestore_core::{properties_from_json, Entity, EntityKind, LorestoreError, Properties, RelationType, Relationship};
use lorestore_index::{Budget, GraphIndex};
use lorestore_memory::{
    BaseRecommendation, ExportFilter, ExportFormat, ImportMode, ImportOptions, KnowledgeMemory,
    MemoryConfig, PatternFilter, PatternState, RecallOptions, RememberMetadata, SimilarityQuery,
    Snapshot,
};
use lorestore_storage::{LogStore, LogStoreOptions};
use proptest::prelude::*;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn config(dir: &Path) -> MemoryConfig {
    let mut config = MemoryConfig::with_data_dir(dir);
    config.storage.sync_writes = false;
    config
}

fn open(dir: &TempDir) -> KnowledgeMemory {
    KnowledgeMemory::open(config(dir.path())).unwrap()
}

fn props(value: serde_json::Value) -> Properties {
    properties_from_json(value).unwrap()
}

fn project(memory: &KnowledgeMemory, id: &str, data: serde_json::Value) {
    memory
        .remember(EntityKind::Project, props(data), RememberMetadata::with_id(id))
        .unwrap();
}

fn technology(memory: &KnowledgeMemory, id: &str) {
    memory
        .remember(
            EntityKind::Technology,
            props(json!({ "name": id })),
            RememberMetadata::with_id(id),
        )
        .unwrap();
}

/// Index rebuilt straight from the log files
fn rebuilt(dir: &Path) -> GraphIndex {
    let log = LogStore::open(dir, LogStoreOptions::default()).unwrap();
    GraphIndex::build(&log.read_all().unwrap().records).0
}

#[test]
fn test_similar_projects_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    project(&memory, "P1", json!({"language": "typescript", "framework": "react", "file_count": 120}));
    project(&memory, "P2", json!({"language": "TypeScript", "framework": "react", "file_count": 140}));
    project(&memory, "P3", json!({"language": "python", "framework": "django", "file_count": 900}));

    let query = SimilarityQuery {
        min_similarity: Some(0.5),
        max_results: None,
    };
    let similar = memory.find_similar("P1", &query);
    let ids: Vec<&str> = similar.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&"P2"));
    assert!(!ids.contains(&"P3"));

    let everything = memory.find_similar(
        "P1",
        &SimilarityQuery {
            min_similarity: Some(0.0),
            max_results: Some(100),
        },
    );
    assert!(everything.iter().all(|s| s.id != "P1"));
    assert!(everything.iter().all(|s| (0.0..=1.0).contains(&s.score)));
    assert!(memory.find_similar("missing", &query).is_empty());
}

#[test]
fn test_learning_recommendation_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    for _ in 0..4 {
        memory.learn([("language", "go")], "hugo", true).unwrap();
    }

    let improved =
        memory.improve_recommendation([("language", "go")], &BaseRecommendation::new("mkdocs", 0.6));
    assert!(improved.confidence > 0.6);
    assert!(improved.insights.iter().any(|i| i.contains("go") && i.contains("hugo")));

    let untouched = memory
        .improve_recommendation([("language", "haskell")], &BaseRecommendation::new("mkdocs", 0.6));
    assert_eq!(untouched.recommendation, "mkdocs");
    assert_eq!(untouched.confidence, 0.6);
    assert!(untouched.insights.is_empty());
}

#[test]
fn test_learning_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);

    let mut last = -1.0;
    for _ in 0..8 {
        let view = memory.learn([("language", "rust")], "mdbook", true).unwrap();
        assert!(view.pattern.confidence > last || view.pattern.confidence == 1.0);
        last = view.pattern.confidence;
    }

    let mut last = 2.0;
    for _ in 0..8 {
        let view = memory.learn([("language", "php")], "sphinx", false).unwrap();
        assert!(view.pattern.confidence < last || view.pattern.confidence == 0.0);
        last = view.pattern.confidence;
    }

    let patterns = memory.patterns(&PatternFilter::default());
    assert_eq!(patterns.len(), 2);
    assert!(patterns.iter().all(|p| p.state == PatternState::Reinforced));
}

#[test]
fn test_patterns_survive_restart_and_relearn() {
    let dir = tempfile::tempdir().unwrap();
    let before = {
        let memory = open(&dir);
        for _ in 0..3 {
            memory.learn([("language", "go"), ("framework", "gin")], "hugo", true).unwrap();
        }
        memory.learn([("language", "python")], "mkdocs", true).unwrap();
        let patterns = memory.patterns(&PatternFilter::default());
        assert_eq!(memory.relearn(), 2);
        assert_eq!(memory.patterns(&PatternFilter::default()), patterns);
        memory.close().unwrap();
        patterns
    };

    let memory = open(&dir);
    let after = memory.patterns(&PatternFilter::default());
    assert_eq!(after.len(), before.len());
    for (a, b) in after.iter().zip(&before) {
        assert_eq!(a.pattern.signature, b.pattern.signature);
        assert_eq!(a.pattern.support_count, b.pattern.support_count);
        assert!((a.pattern.confidence - b.pattern.confidence).abs() < 1e-12);
    }
    assert_eq!(memory.statistics().pattern_count, 2);
}

#[test]
fn test_idempotent_reassertion() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    project(&memory, "p", json!({}));
    technology(&memory, "react");

    memory
        .relate("p", "react", RelationType::UsesTechnology, 0.4, props(json!({"source": "scan"})))
        .unwrap();
    let first = memory.find_relationships("p")[0].clone();
    memory
        .relate("p", "react", RelationType::UsesTechnology, 0.9, props(json!({"verified": true})))
        .unwrap();

    let relationships = memory.find_relationships("p");
    assert_eq!(relationships.len(), 1);
    assert_eq!(relationships[0].weight, 0.9);
    assert_eq!(relationships[0].created_at, first.created_at);
    assert_eq!(relationships[0].properties.len(), 2);
    assert_eq!(memory.statistics().edge_count, 1);
}

#[test]
fn test_paths() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    for id in ["a", "b", "c", "x", "y"] {
        project(&memory, id, json!({}));
    }
    memory.relate("a", "b", RelationType::DependsOn, 1.0, Properties::new()).unwrap();
    memory.relate("b", "c", RelationType::DependsOn, 1.0, Properties::new()).unwrap();
    memory.relate("a", "c", RelationType::DependsOn, 0.1, Properties::new()).unwrap();
    memory.relate("x", "y", RelationType::DependsOn, 1.0, Properties::new()).unwrap();

    assert_eq!(memory.find_path("a", "c"), Some(vec!["a".to_string(), "c".to_string()]));
    let weighted = memory.find_weighted_path("a", "c").unwrap();
    assert_eq!(weighted.ids, vec!["a", "b", "c"]);

    assert_eq!(memory.find_path("a", "y"), None);
    assert!(memory.find_weighted_path("c", "x").is_none());
    assert_eq!(memory.find_path("a", "nowhere"), None);

    let hub = memory.centrality("b", &Budget::unlimited()).unwrap();
    assert!(!hub.truncated);
    assert_eq!(hub.value.degree, 2);
}

#[test]
fn test_export_import_round_trip() {
    let source_dir = tempfile::tempdir().unwrap();
    let source = open(&source_dir);
    project(&source, "p1", json!({"language": "rust", "note": "a,b \"quoted\""}));
    project(&source, "p2", json!({"language": "rust"}));
    technology(&source, "tokio");
    source.relate("p1", "tokio", RelationType::UsesTechnology, 0.75, Properties::new()).unwrap();
    source.relate("p2", "tokio", RelationType::UsesTechnology, 1.0, Properties::new()).unwrap();
    source.learn([("language", "rust")], "mdbook", true).unwrap();

    let blob = source.export_graph(ExportFormat::Json, &ExportFilter::default()).unwrap();

    let target_dir = tempfile::tempdir().unwrap();
    let target = open(&target_dir);
    let summary = target.import_graph(&blob, ImportOptions::default()).unwrap();
    assert_eq!(summary.entities_added, 4);
    assert_eq!(summary.relationships_added, 2);

    let (a, b) = (source.statistics(), target.statistics());
    assert_eq!(a.node_count, b.node_count);
    assert_eq!(a.edge_count, b.edge_count);
    assert_eq!(source.graph(), target.graph());
    // Observations travel with the snapshot, so patterns do too
    assert_eq!(b.pattern_count, 1);

    // Re-importing the same snapshot changes nothing
    let again = target.import_graph(&blob, ImportOptions::default()).unwrap();
    assert_eq!(again.entities_unchanged, 4);
    assert_eq!(again.relationships_unchanged, 2);
    assert_eq!(again.entities_added + again.entities_updated, 0);
}

#[test]
fn test_import_replace_and_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    project(&memory, "old", json!({}));

    let snapshot = Snapshot::new(
        vec![
            Entity::new("n1", EntityKind::Project),
            Entity::new("n2", EntityKind::Technology),
        ],
        vec![Relationship::new("n1", "n2", RelationType::UsesTechnology)],
    )
    .unwrap();
    let blob = serde_json::to_vec(&snapshot).unwrap();

    let dry = memory
        .import_graph(&blob, ImportOptions { mode: ImportMode::Replace, dry_run: true })
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.entities_added, 2);
    assert!(memory.get_entity("old").is_some());
    assert!(memory.get_entity("n1").is_none());

    memory
        .import_graph(&blob, ImportOptions { mode: ImportMode::Replace, dry_run: false })
        .unwrap();
    assert!(memory.get_entity("old").is_none());
    assert_eq!(memory.graph().entity_count(), 2);
    assert_eq!(memory.graph(), rebuilt(dir.path()));

    let mut future: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    future["formatVersion"] = json!(99);
    let err = memory
        .import_graph(&serde_json::to_vec(&future).unwrap(), ImportOptions::default())
        .unwrap_err();
    assert!(matches!(err, LorestoreError::IncompatibleVersion { found: 99, .. }));
}

#[test]
fn test_crash_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    {
        let memory = open(&dir);
        project(&memory, "kept-1", json!({"language": "go"}));
        project(&memory, "kept-2", json!({"language": "go"}));
        memory.close().unwrap();
    }

    // Simulate a torn write at the end of the entity log
    let path = dir.path().join("entities.log");
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"recordType":"entity","id":"torn","kind":"proj"#).unwrap();
    drop(file);

    {
        let memory = open(&dir);
        assert_eq!(memory.recovery().discarded_trailing, 1);
        assert!(memory.get_entity("kept-1").is_some());
        assert!(memory.get_entity("kept-2").is_some());
        assert!(memory.get_entity("torn").is_none());
        project(&memory, "after", json!({}));
        memory.close().unwrap();
    }

    let memory = open(&dir);
    assert_eq!(memory.recovery().discarded_trailing, 0);
    assert_eq!(memory.graph().entity_count(), 3);
    assert!(memory.get_entity("after").is_some());
}

#[test]
fn test_torn_first_relationship_opens() {
    let dir = tempfile::tempdir().unwrap();
    {
        let memory = open(&dir);
        project(&memory, "a", json!({}));
        project(&memory, "b", json!({}));
        memory.close().unwrap();
    }
    std::fs::write(
        dir.path().join("relationships.log"),
        br#"{"recordType":"relationship","sourceId":"a","targ"#,
    )
    .unwrap();

    let memory = open(&dir);
    assert_eq!(memory.recovery().discarded_trailing, 1);
    assert_eq!(memory.graph().entity_count(), 2);
    assert_eq!(memory.graph().relationship_count(), 0);

    memory.relate("a", "b", RelationType::DependsOn, 1.0, Properties::new()).unwrap();
    memory.close().unwrap();
    let memory = open(&dir);
    assert_eq!(memory.find_relationships("a").len(), 1);
}

#[test]
fn test_merge_import_keeps_destination_fields() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    memory
        .remember(
            EntityKind::Project,
            props(json!({"language": "rust", "stars": 5})),
            RememberMetadata::with_id("p1").tags(["keep-me"]),
        )
        .unwrap();

    let newer = Utc::now() + Duration::hours(1);
    let snapshot = Snapshot::new(
        vec![Entity::new("p1", EntityKind::Project)
            .with_property("language", "go")
            .with_property("license", "mit")
            .at(newer)],
        Vec::new(),
    )
    .unwrap();
    let summary = memory
        .import_graph(&serde_json::to_vec(&snapshot).unwrap(), ImportOptions::default())
        .unwrap();
    assert_eq!(summary.entities_updated, 1);

    let merged = memory.get_entity("p1").unwrap();
    assert_eq!(merged.text_property("language"), Some("go"));
    assert_eq!(merged.text_property("license"), Some("mit"));
    assert_eq!(merged.number_property("stars"), Some(5.0));
    assert!(merged.tags.contains("keep-me"));
    assert_eq!(memory.graph(), rebuilt(dir.path()));

    // An older snapshot only fills in fields the store lacks
    let older = Utc::now() - Duration::days(3);
    let stale = Snapshot::new(
        vec![Entity::new("p1", EntityKind::Project)
            .with_property("language", "cobol")
            .with_property("homepage", "https://example.org")
            .at(older)],
        Vec::new(),
    )
    .unwrap();
    memory
        .import_graph(&serde_json::to_vec(&stale).unwrap(), ImportOptions::default())
        .unwrap();
    let merged = memory.get_entity("p1").unwrap();
    assert_eq!(merged.text_property("language"), Some("go"));
    assert_eq!(merged.text_property("homepage"), Some("https://example.org"));
    assert_eq!(merged.created_at, older);
}

#[test]
fn test_corrupt_store_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("entities.log"), "garbage\nmore garbage\n").unwrap();
    let err = KnowledgeMemory::open(config(dir.path())).err().unwrap();
    assert!(matches!(err, LorestoreError::Corruption { .. }));
}

#[test]
fn test_cleanup_removes_expired() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    let old = Utc::now() - Duration::days(120);
    let snapshot = Snapshot::new(
        vec![
            Entity::new("stale", EntityKind::Project).at(old),
            Entity::new("stale-tech", EntityKind::Technology).at(old),
        ],
        vec![Relationship::new("stale", "stale-tech", RelationType::UsesTechnology).at(old)],
    )
    .unwrap();
    memory
        .import_graph(&serde_json::to_vec(&snapshot).unwrap(), ImportOptions::default())
        .unwrap();
    project(&memory, "fresh", json!({}));
    memory
        .relate("fresh", "stale-tech", RelationType::UsesTechnology, 1.0, Properties::new())
        .unwrap();

    let removed = memory.cleanup(Duration::days(30)).unwrap();
    assert_eq!(removed, 2);
    assert!(memory.get_entity("fresh").is_some());
    assert!(memory.find_relationships("fresh").is_empty());
    assert_eq!(memory.graph(), rebuilt(dir.path()));
}

#[test]
fn test_cleanup_on_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let memory = open(&dir);
        let snapshot = Snapshot::new(
            vec![Entity::new("ancient", EntityKind::User).at(Utc::now() - Duration::days(400))],
            Vec::new(),
        )
        .unwrap();
        memory
            .import_graph(&serde_json::to_vec(&snapshot).unwrap(), ImportOptions::default())
            .unwrap();
        project(&memory, "recent", json!({}));
        memory.close().unwrap();
    }

    let mut config = config(dir.path());
    config.retention.max_age_days = 365;
    config.retention.cleanup_on_open = true;
    let memory = KnowledgeMemory::open(config).unwrap();
    assert!(memory.get_entity("ancient").is_none());
    assert!(memory.get_entity("recent").is_some());
}

#[test]
fn test_backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    project(&memory, "before", json!({}));
    let manifest = memory.backup().unwrap();
    assert_eq!(manifest.entity_records, 1);
    assert!(memory.verify_backup(&manifest.id).unwrap());

    project(&memory, "after", json!({}));
    memory.restore_backup(&manifest.id).unwrap();
    assert!(memory.get_entity("before").is_some());
    assert!(memory.get_entity("after").is_none());
    assert_eq!(memory.graph(), rebuilt(dir.path()));

    assert_eq!(memory.list_backups().unwrap().len(), 1);
    assert!(memory.prune_backups(0).is_err());
}

#[test]
fn test_periodic_backups_are_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.storage.backup_every_appends = Some(3);
    config.storage.max_backups = 2;
    let memory = KnowledgeMemory::open(config).unwrap();

    for i in 0..9 {
        project(&memory, &format!("p{}", i), json!({}));
    }
    let backups = memory.list_backups().unwrap();
    assert_eq!(backups.len(), 2);
    assert_eq!(backups[1].entity_records, 9);
}

#[test]
fn test_recall_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let memory = open(&dir);
    memory
        .remember(
            EntityKind::DocumentationSection,
            props(json!({"title": "Deploying with Hugo"})),
            RememberMetadata::with_id("doc-deploy").tags(["critical", "docs"]),
        )
        .unwrap();
    project(&memory, "site", json!({"framework": "hugo"}));
    memory
        .relate("doc-deploy", "site", RelationType::Documents, 1.0, Properties::new())
        .unwrap();

    let hits = memory.recall("hugo", &RecallOptions::default());
    assert_eq!(hits.len(), 2);

    let health = memory.health_score();
    assert_eq!(health.critical_items, 1);
    assert_eq!(health.total_items, 3);
    assert!(health.score > 0 && health.score < 100);

    assert_eq!(memory.tag_distribution(10).len(), 2);
    assert_eq!(memory.kind_distribution()[&EntityKind::Project], 1);
    assert_eq!(memory.relation_distribution()[&RelationType::Documents], 1);
    let timeline = memory.activity_timeline(Default::default(), None);
    assert_eq!(timeline.iter().map(|b| b.count).sum::<usize>(), 2);
}

#[test]
fn test_concurrent_writers_and_readers() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(open(&dir));
    technology(&memory, "shared");

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let memory = Arc::clone(&memory);
            std::thread::spawn(move || {
                for i in 0..25 {
                    let id = format!("w{}-{}", w, i);
                    project(&memory, &id, json!({"writer": w}));
                    memory
                        .relate(&id, "shared", RelationType::UsesTechnology, 0.5, Properties::new())
                        .unwrap();
                }
            })
        })
        .collect();
    let reader = {
        let memory = Arc::clone(&memory);
        std::thread::spawn(move || {
            for _ in 0..50 {
                let stats = memory.statistics();
                assert!(stats.edge_count <= stats.node_count);
                let _ = memory.recall("w1", &RecallOptions::default());
            }
        })
    };
    for handle in writers {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    let graph = memory.graph();
    assert_eq!(graph.entity_count(), 101);
    assert_eq!(graph.relationship_count(), 100);
    assert_eq!(graph, rebuilt(dir.path()));
}

#[derive(Debug, Clone)]
enum Op {
    Remember { id: u8, technology: bool, tag: u8 },
    Relate { from: u8, to: u8, relation: u8, weight: u8 },
    Learn { language: u8, success: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, any::<bool>(), 0u8..3)
            .prop_map(|(id, technology, tag)| Op::Remember { id, technology, tag }),
        (0u8..6, 0u8..6, 0u8..3, 0u8..=10)
            .prop_map(|(from, to, relation, weight)| Op::Relate { from, to, relation, weight }),
        (0u8..2, any::<bool>()).prop_map(|(language, success)| Op::Learn { language, success }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Rebuilding the index from the log gives the incrementally maintained index
    #[test]
    fn prop_log_index_equivalence(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(&dir);
        let relations = [RelationType::DependsOn, RelationType::SimilarTo, RelationType::DeployedWith];

        for op in &ops {
            // Rejected operations (kind changes, missing endpoints) must not disturb anything
            let _ = match op {
                Op::Remember { id, technology, tag } => {
                    let kind = if *technology { EntityKind::Technology } else { EntityKind::Project };
                    memory
                        .remember(
                            kind,
                            props(json!({"language": format!("lang{}", tag)})),
                            RememberMetadata::with_id(format!("e{}", id)).tags([format!("t{}", tag)]),
                        )
                        .map(|_| ())
                }
                Op::Relate { from, to, relation, weight } => memory
                    .relate(
                        &format!("e{}", from),
                        &format!("e{}", to),
                        relations[*relation as usize],
                        f64::from(*weight) / 10.0,
                        Properties::new(),
                    )
                    .map(|_| ()),
                Op::Learn { language, success } => memory
                    .learn([("language", format!("lang{}", language))], "hugo", *success)
                    .map(|_| ()),
            };
        }

        let incremental = memory.graph();
        prop_assert_eq!(&incremental, &rebuilt(dir.path()));

        memory.close().unwrap();
        let reopened = open(&dir);
        prop_assert_eq!(reopened.graph(), incremental);
    }
}
