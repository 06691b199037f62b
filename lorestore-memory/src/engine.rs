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

//! The knowledge memory engine
//!
//! Writes flow one way, under a single writer lock:
//!
//! ```text
//! validate → merge with stored state → append to log → apply to index
//! ```
//!
//! Reads take the index read lock only, so they never wait on disk I/O.
//! Compaction, periodic backups and pattern recomputation all run inside the
//! operation that triggers them; there are no background threads.

use crate::config::MemoryConfig;
use crate::learning::{
    normalize_context, BaseRecommendation, Context, ImprovedRecommendation, Observation,
    PatternEngine, PatternFilter, PatternView,
};
use crate::recall::{recall, RecallEntry, RecallOptions};
use crate::reporting::{self, GraphStatistics, Granularity, HealthReport, TimelineBucket};
use crate::snapshot::{self, plan_import, ExportFilter, ExportFormat, ImportMode, ImportOptions, ImportSummary, Snapshot};
use chrono::{DateTime, Duration, Utc};
use lorestore_core::{
    Entity, EntityId, EntityKind, LogRecord, Properties, RelationType, Relationship,
    RelationshipKey, Result,
};
use lorestore_index::{
    centrality, detect_anomalies, find_similar, shortest_path, weighted_path, Anomaly,
    AnomalyOptions, Bounded, Budget, CentralityReport, ClusteringResult, GraphIndex,
    LeidenClustering, Path, PathOptions, SimilarEntity,
};
use lorestore_storage::{BackupManager, BackupManifest, LogStats, LogStore, RecoverySummary};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Most connected entities listed in statistics
const STATISTICS_TOP: usize = 5;

/// Optional identity and tags for [`KnowledgeMemory::remember`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RememberMetadata {
    /// Generated as `<kind>-<uuid>` when unset
    pub id: Option<EntityId>,
    pub tags: Vec<String>,
}

impl RememberMetadata {
    pub fn with_id(id: impl Into<EntityId>) -> Self {
        Self {
            id: Some(id.into()),
            tags: Vec::new(),
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Similarity query; configured defaults fill unset fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityQuery {
    pub min_similarity: Option<f64>,
    pub max_results: Option<usize>,
}

/// State guarded by the writer lock
struct WriteState {
    log: LogStore,
    appends_since_backup: u64,
}

/// Persistent knowledge-graph memory
///
/// `Send + Sync`; share it behind an `Arc`. There is no cross-process
/// locking, so only one process may open a storage root at a time.
pub struct KnowledgeMemory {
    config: MemoryConfig,
    writer: Mutex<WriteState>,
    index: RwLock<GraphIndex>,
    learning: RwLock<PatternEngine>,
    /// Set when the pattern cache no longer reflects the log
    patterns_dirty: AtomicBool,
    backups: BackupManager,
}

impl KnowledgeMemory {
    /// Open (or create) the store under `config.storage.data_dir`, replaying
    /// the log into a fresh index.
    pub fn open(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let root = config.storage.data_dir.clone();
        let log = LogStore::open(&root, config.storage.log_options())?;

        let report = log.read_all()?;
        if report.discarded_trailing > 0 || report.skipped_corrupt > 0 {
            warn!(
                discarded_trailing = report.discarded_trailing,
                skipped_corrupt = report.skipped_corrupt,
                "Recovered log with unreadable records"
            );
        }
        let (index, build) = GraphIndex::build(&report.records);
        if build.skipped_relationships > 0 || build.rejected_entities > 0 {
            warn!(
                skipped_relationships = build.skipped_relationships,
                rejected_entities = build.rejected_entities,
                "Index build skipped inconsistent records"
            );
        }

        let memory = Self {
            learning: RwLock::new(PatternEngine::new(config.learning.clone())),
            backups: BackupManager::new(&root),
            writer: Mutex::new(WriteState {
                log,
                appends_since_backup: 0,
            }),
            index: RwLock::new(index),
            patterns_dirty: AtomicBool::new(true),
            config,
        };

        let retention = &memory.config.retention;
        if retention.cleanup_on_open && retention.max_age_days > 0 {
            memory.cleanup(Duration::days(i64::from(retention.max_age_days)))?;
        }

        info!(
            path = %root.display(),
            entities = build.entities,
            relationships = build.relationships,
            "Opened knowledge memory"
        );
        Ok(memory)
    }

    /// Close the store, compacting first when the ratio rule asks for it
    pub fn close(self) -> Result<()> {
        let Self { writer, .. } = self;
        let mut state = writer.into_inner();
        if state.log.should_compact() {
            state.log.compact_latest()?;
        }
        info!(path = %state.log.root().display(), "Closed knowledge memory");
        Ok(())
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &FsPath {
        &self.config.storage.data_dir
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create or update an entity. An existing id merges properties and tags,
    /// keeps `created_at` and must keep its kind.
    pub fn remember(
        &self,
        kind: EntityKind,
        data: Properties,
        metadata: RememberMetadata,
    ) -> Result<EntityId> {
        let id = metadata.id.unwrap_or_else(|| generate_id(kind));
        let incoming = Entity::new(id.clone(), kind)
            .with_properties(data)
            .with_tags(metadata.tags);
        incoming.validate()?;

        let mut state = self.writer.lock();
        let record = {
            let index = self.index.read();
            let entity = match index.get_entity(&id) {
                Some(existing) => existing.merged_with(&incoming)?,
                None => incoming,
            };
            index.check_entity(&entity)?;
            LogRecord::Entity(entity)
        };
        self.commit(&mut state, &record)?;
        if kind == EntityKind::Observation {
            self.patterns_dirty.store(true, Ordering::SeqCst);
        }
        self.after_write(&mut state);

        debug!(id = %id, kind = %kind, "Remembered entity");
        Ok(id)
    }

    /// Create or re-assert a relationship. Both endpoints must exist.
    /// Re-asserting a triple replaces its weight and merges its properties.
    pub fn relate(
        &self,
        source: &str,
        target: &str,
        relation: RelationType,
        weight: f64,
        properties: Properties,
    ) -> Result<RelationshipKey> {
        let incoming = Relationship::new(source, target, relation)
            .with_weight(weight)
            .with_properties(properties);
        incoming.validate()?;
        let key = incoming.key();

        let mut state = self.writer.lock();
        let record = {
            let index = self.index.read();
            let relationship = match index.get_relationship(&key) {
                Some(existing) => existing.merged_with(&incoming),
                None => incoming,
            };
            index.check_relationship(&relationship)?;
            LogRecord::Relationship(relationship)
        };
        self.commit(&mut state, &record)?;
        if relation == RelationType::DeployedWith {
            self.patterns_dirty.store(true, Ordering::SeqCst);
        }
        self.after_write(&mut state);

        debug!(relationship = %key, "Related entities");
        Ok(key)
    }

    /// Record a (context → outcome) observation and update its pattern
    pub fn learn<K, V, I>(&self, context: I, outcome: &str, success: bool) -> Result<PatternView>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let observation = Observation::new(
            normalize_context(context),
            outcome.trim().to_lowercase(),
            success,
        );
        observation.validate()?;
        let entity = observation.to_entity(generate_id(EntityKind::Observation));

        let mut state = self.writer.lock();
        if self.patterns_dirty.load(Ordering::SeqCst) {
            self.relearn_locked(&state);
        }
        self.index.read().check_entity(&entity)?;
        self.commit(&mut state, &LogRecord::Entity(entity))?;

        let view = {
            let mut learning = self.learning.write();
            let pattern = learning.observe(&observation).clone();
            learning.view(&pattern, Utc::now())
        };
        self.after_write(&mut state);

        debug!(
            signature = %view.pattern.signature,
            outcome = %view.pattern.outcome,
            confidence = view.pattern.confidence,
            "Learned observation"
        );
        Ok(view)
    }

    /// Import a native snapshot
    pub fn import_graph(&self, blob: &[u8], options: ImportOptions) -> Result<ImportSummary> {
        let snapshot = Snapshot::from_slice(blob)?;

        let mut state = self.writer.lock();
        let plan = plan_import(&self.index.read(), &snapshot, options);
        if options.dry_run {
            return Ok(plan.summary);
        }

        match options.mode {
            ImportMode::Merge => {
                for record in &plan.records {
                    self.commit(&mut state, record)?;
                }
                self.after_write(&mut state);
            }
            ImportMode::Replace => {
                state.log.replace_all(&plan.records)?;
                let (index, _) = GraphIndex::build(&plan.records);
                *self.index.write() = index;
            }
        }
        self.patterns_dirty.store(true, Ordering::SeqCst);

        let summary = plan.summary;
        info!(
            mode = ?summary.mode,
            entities_added = summary.entities_added,
            entities_updated = summary.entities_updated,
            relationships_added = summary.relationships_added,
            skipped = summary.skipped_kind_conflicts + summary.skipped_relationships,
            "Imported snapshot"
        );
        Ok(summary)
    }

    /// Remove entities not updated within `older_than`, with their
    /// relationships. Returns the number of entities removed.
    pub fn cleanup(&self, older_than: Duration) -> Result<usize> {
        self.cleanup_before(Utc::now() - older_than)
    }

    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.writer.lock();
        let doomed: HashSet<EntityId> = self
            .index
            .read()
            .entities()
            .filter(|e| e.updated_at < cutoff)
            .map(|e| e.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let removed_records = state.log.compact(|record| match record {
            LogRecord::Entity(e) => !doomed.contains(&e.id),
            LogRecord::Relationship(r) => {
                !doomed.contains(&r.source_id) && !doomed.contains(&r.target_id)
            }
        })?;

        let mut removed_relationships = 0;
        {
            let mut index = self.index.write();
            for id in &doomed {
                if let Some((_, edges)) = index.remove_entity(id) {
                    removed_relationships += edges.len();
                }
            }
        }
        self.patterns_dirty.store(true, Ordering::SeqCst);

        info!(
            entities = doomed.len(),
            relationships = removed_relationships,
            records = removed_records,
            cutoff = %cutoff,
            "Removed expired entities"
        );
        Ok(doomed.len())
    }

    /// Drop superseded records from the log. Returns records removed.
    pub fn compact(&self) -> Result<usize> {
        self.writer.lock().log.compact_latest()
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    pub fn backup(&self) -> Result<BackupManifest> {
        let mut state = self.writer.lock();
        let manifest = self.backups.create(&state.log)?;
        state.appends_since_backup = 0;
        Ok(manifest)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        self.backups.list()
    }

    pub fn verify_backup(&self, id: &str) -> Result<bool> {
        self.backups.verify(id)
    }

    /// Atomically replace the log with a backup and rebuild the index
    pub fn restore_backup(&self, id: &str) -> Result<BackupManifest> {
        let mut state = self.writer.lock();
        let manifest = self.backups.restore(id, &mut state.log)?;
        let report = state.log.read_all()?;
        let (index, _) = GraphIndex::build(&report.records);
        *self.index.write() = index;
        self.patterns_dirty.store(true, Ordering::SeqCst);
        Ok(manifest)
    }

    /// Keep the newest `keep` backups. Returns removed ids.
    pub fn prune_backups(&self, keep: usize) -> Result<Vec<String>> {
        let _state = self.writer.lock();
        self.backups.prune(keep)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        self.index.read().get_entity(id).cloned()
    }

    pub fn recall(&self, query: &str, options: &RecallOptions) -> Vec<RecallEntry> {
        recall(&self.index.read(), query, options)
    }

    pub fn find_similar(&self, id: &str, query: &SimilarityQuery) -> Vec<SimilarEntity> {
        let analytics = &self.config.analytics;
        find_similar(
            &self.index.read(),
            id,
            query.min_similarity.unwrap_or(analytics.min_similarity),
            query.max_results.unwrap_or(analytics.max_results),
            &analytics.similarity,
        )
    }

    /// Every relationship touching `id`, sorted by key
    pub fn find_relationships(&self, id: &str) -> Vec<Relationship> {
        let mut relationships: Vec<Relationship> = self
            .index
            .read()
            .relationships_of(id)
            .into_iter()
            .cloned()
            .collect();
        relationships.sort_by_key(Relationship::key);
        relationships
    }

    /// Fewest-hops path ignoring direction
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<EntityId>> {
        self.find_path_with(from, to, &PathOptions::default())
            .map(|path| path.ids)
    }

    pub fn find_path_with(&self, from: &str, to: &str, options: &PathOptions) -> Option<Path> {
        shortest_path(&self.index.read(), from, to, options)
    }

    /// Strongest path, each edge costing `1 / weight`
    pub fn find_weighted_path(&self, from: &str, to: &str) -> Option<Path> {
        weighted_path(&self.index.read(), from, to, &PathOptions::default())
    }

    /// Budget built from the analytics configuration
    pub fn default_budget(&self) -> Budget {
        let analytics = &self.config.analytics;
        let mut budget = match analytics.centrality_timeout_ms {
            Some(ms) => Budget::with_timeout(std::time::Duration::from_millis(ms)),
            None => Budget::unlimited(),
        };
        if let Some(max_nodes) = analytics.centrality_max_nodes {
            budget = budget.max_nodes(max_nodes);
        }
        budget
    }

    pub fn centrality(&self, id: &str, budget: &Budget) -> Option<Bounded<CentralityReport>> {
        centrality(&self.index.read(), id, budget)
    }

    pub fn communities(&self) -> ClusteringResult {
        LeidenClustering::with_config(self.config.analytics.leiden.clone()).detect(&self.index.read())
    }

    pub fn detect_anomalies(&self, options: &AnomalyOptions) -> Vec<Anomaly> {
        detect_anomalies(&self.index.read(), options)
    }

    pub fn statistics(&self) -> GraphStatistics {
        let pattern_count = self.ensure_patterns().len();
        reporting::statistics(&self.index.read(), pattern_count, STATISTICS_TOP)
    }

    pub fn storage_stats(&self) -> LogStats {
        self.writer.lock().log.stats()
    }

    /// What the last open had to repair in the log
    pub fn recovery(&self) -> RecoverySummary {
        self.writer.lock().log.recovery()
    }

    // ------------------------------------------------------------------
    // Learning
    // ------------------------------------------------------------------

    pub fn patterns(&self, filter: &PatternFilter) -> Vec<PatternView> {
        self.ensure_patterns().query(filter, Utc::now())
    }

    /// Blend learned patterns into a base recommendation. Never fails; with
    /// no matching pattern the base comes back unchanged.
    pub fn improve_recommendation<K, V, I>(
        &self,
        features: I,
        base: &BaseRecommendation,
    ) -> ImprovedRecommendation
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let features: Context = normalize_context(features);
        self.ensure_patterns().improve(&features, base, Utc::now())
    }

    /// Recompute every pattern from the log. Returns the pattern count.
    pub fn relearn(&self) -> usize {
        let state = self.writer.lock();
        self.relearn_locked(&state)
    }

    // ------------------------------------------------------------------
    // Export and reports
    // ------------------------------------------------------------------

    pub fn export_graph(&self, format: ExportFormat, filter: &ExportFilter) -> Result<Vec<u8>> {
        snapshot::export(&self.index.read(), format, filter)
    }

    pub fn export_graph_with<F>(&self, format: ExportFormat, keep: F) -> Result<Vec<u8>>
    where
        F: Fn(&Entity) -> bool,
    {
        snapshot::export_with(&self.index.read(), format, keep)
    }

    pub fn activity_timeline(
        &self,
        granularity: Granularity,
        kind: Option<EntityKind>,
    ) -> Vec<TimelineBucket> {
        reporting::activity_timeline(&self.index.read(), granularity, kind)
    }

    pub fn kind_distribution(&self) -> BTreeMap<EntityKind, usize> {
        reporting::kind_distribution(&self.index.read())
    }

    pub fn relation_distribution(&self) -> BTreeMap<RelationType, usize> {
        reporting::relation_distribution(&self.index.read())
    }

    pub fn tag_distribution(&self, limit: usize) -> Vec<(String, usize)> {
        reporting::tag_distribution(&self.index.read(), limit)
    }

    pub fn health_score(&self) -> HealthReport {
        reporting::health_score(
            &self.index.read(),
            Utc::now(),
            Duration::days(self.config.analytics.recency_window_days),
        )
    }

    /// A copy of the current index
    pub fn graph(&self) -> GraphIndex {
        self.index.read().clone()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Append a validated record and apply it to the index
    fn commit(&self, state: &mut WriteState, record: &LogRecord) -> Result<()> {
        state.log.append(record)?;
        self.index.write().apply(record)?;
        state.appends_since_backup += 1;
        Ok(())
    }

    /// Automatic compaction and periodic backups. Failures are logged; the
    /// write that triggered them is already durable.
    fn after_write(&self, state: &mut WriteState) {
        if state.log.should_compact() {
            if let Err(e) = state.log.compact_latest() {
                warn!(error = %e, "Automatic compaction failed");
            }
        }

        let Some(every) = self.config.storage.backup_every_appends else {
            return;
        };
        if state.appends_since_backup < every {
            return;
        }
        match self.backups.create(&state.log) {
            Ok(manifest) => {
                state.appends_since_backup = 0;
                debug!(backup_id = %manifest.id, "Periodic backup");
                if let Err(e) = self.backups.prune(self.config.storage.max_backups) {
                    warn!(error = %e, "Pruning backups failed");
                }
            }
            Err(e) => warn!(error = %e, "Periodic backup failed"),
        }
    }

    /// Pattern cache, recomputed first when stale
    fn ensure_patterns(&self) -> parking_lot::RwLockReadGuard<'_, PatternEngine> {
        if self.patterns_dirty.load(Ordering::SeqCst) {
            let state = self.writer.lock();
            if self.patterns_dirty.load(Ordering::SeqCst) {
                self.relearn_locked(&state);
            }
        }
        self.learning.read()
    }

    /// Replay observation entities and `deployed-with` edges in time order.
    /// The writer lock keeps the index still while the cache is rebuilt.
    fn relearn_locked(&self, _state: &WriteState) -> usize {
        let index = self.index.read();
        let learning = &self.config.learning;

        let mut observations: Vec<Observation> = index
            .sorted_ids()
            .into_iter()
            .filter_map(|id| index.get_entity(id))
            .filter_map(Observation::from_entity)
            .collect();

        let mut deployments: Vec<&Relationship> = index
            .relationships()
            .filter(|r| r.relation == RelationType::DeployedWith)
            .collect();
        deployments.sort_by_key(|r| r.key());
        for edge in deployments {
            let (Some(project), Some(target)) =
                (index.get_entity(&edge.source_id), index.get_entity(&edge.target_id))
            else {
                continue;
            };
            let context = normalize_context(learning.context_keys.iter().filter_map(|key| {
                project
                    .property(key)
                    .and_then(|v| v.scalar_string())
                    .map(|v| (key.as_str(), v))
            }));
            let outcome = target
                .text_property("name")
                .unwrap_or(&target.id)
                .trim()
                .to_lowercase();
            let observation = Observation {
                context,
                outcome,
                success: edge.success().unwrap_or(true),
                observed_at: edge.updated_at,
            };
            if observation.validate().is_ok() {
                observations.push(observation);
            }
        }

        let engine = PatternEngine::replay(learning.clone(), observations);
        let count = engine.len();
        *self.learning.write() = engine;
        self.patterns_dirty.store(false, Ordering::SeqCst);
        debug!(patterns = count, "Recomputed patterns");
        count
    }
}

fn generate_id(kind: EntityKind) -> EntityId {
    format!("{}-{}", kind.as_str(), Uuid::new_v4().simple())
}
