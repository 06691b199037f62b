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

//! Knowledge memory configuration
//!
//! Loaded from a TOML file, then overridden by `LORESTORE_*` environment
//! variables, then checked with [`MemoryConfig::validate`]. Every section and
//! field has a default, so a partial file is valid.

use lorestore_core::{LorestoreError, Result, RetryPolicy};
use lorestore_index::{AnomalyOptions, LeidenConfig, SimilarityConfig};
use lorestore_storage::{LogStoreOptions, DEFAULT_COMPACTION_MIN_RECORDS, DEFAULT_COMPACTION_RATIO};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for [`KnowledgeMemory`](crate::KnowledgeMemory)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub storage: StorageConfig,
    pub learning: LearningConfig,
    pub analytics: AnalyticsConfig,
    pub retention: RetentionConfig,
}

/// Log store location and durability settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root holding `entities.log`, `relationships.log` and `backups/`
    pub data_dir: PathBuf,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub compaction_ratio: u64,
    pub compaction_min_records: u64,
    /// fsync after every append
    pub sync_writes: bool,
    /// Take a backup every N appends (disabled when unset)
    pub backup_every_appends: Option<u64>,
    /// Backups kept by periodic pruning
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retry_attempts: 3,
            retry_initial_delay_ms: 50,
            compaction_ratio: DEFAULT_COMPACTION_RATIO,
            compaction_min_records: DEFAULT_COMPACTION_MIN_RECORDS,
            sync_writes: true,
            backup_every_appends: None,
            max_backups: 10,
        }
    }
}

impl StorageConfig {
    pub fn log_options(&self) -> LogStoreOptions {
        LogStoreOptions {
            retry: RetryPolicy::exponential()
                .with_attempts(self.retry_attempts)
                .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms)),
            compaction_ratio: self.compaction_ratio,
            compaction_min_records: self.compaction_min_records,
            sync_writes: self.sync_writes,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lorestore")
}

/// Pattern learning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Confidence of a pattern on first observation, and the decay target
    pub prior: f64,
    /// EMA step toward each new outcome
    pub learning_rate: f64,
    /// Days without observations before a pattern starts to decay
    pub stale_horizon_days: f64,
    pub decay_half_life_days: f64,
    /// Support assumed for a caller's base recommendation
    pub base_support: u64,
    /// Project properties that form the context of `deployed-with` edges
    pub context_keys: Vec<String>,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            prior: 0.5,
            learning_rate: 0.2,
            stale_horizon_days: 90.0,
            decay_half_life_days: 30.0,
            base_support: 1,
            context_keys: vec![
                "language".to_string(),
                "framework".to_string(),
                "ecosystem".to_string(),
            ],
        }
    }
}

/// Defaults for the read-only analytics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub similarity: SimilarityConfig,
    pub min_similarity: f64,
    pub max_results: usize,
    pub leiden: LeidenConfig,
    /// Deadline for centrality queries (unbounded when unset)
    pub centrality_timeout_ms: Option<u64>,
    pub centrality_max_nodes: Option<usize>,
    pub anomaly: AnomalyOptions,
    /// Window for the health report's recency component
    pub recency_window_days: i64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            similarity: SimilarityConfig::default(),
            min_similarity: 0.5,
            max_results: 10,
            leiden: LeidenConfig::default(),
            centrality_timeout_ms: None,
            centrality_max_nodes: None,
            anomaly: AnomalyOptions::default(),
            recency_window_days: 30,
        }
    }
}

/// Age-based cleanup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Entities not updated for this many days are removed (0 = keep forever)
    pub max_age_days: u32,
    pub cleanup_on_open: bool,
}

impl MemoryConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| {
            LorestoreError::Config(format!("{}: {}", path.as_ref().display(), e))
        })
    }

    /// Defaults overridden by environment variables
    ///
    /// Supported environment variables:
    /// - LORESTORE_DATA_DIR: storage root
    /// - LORESTORE_RETRY_ATTEMPTS: append attempts before failing (default: 3)
    /// - LORESTORE_LEARNING_RATE: EMA learning rate (default: 0.2)
    /// - LORESTORE_STALE_HORIZON_DAYS: days before patterns decay (default: 90)
    /// - LORESTORE_MAX_AGE_DAYS: retention age, 0 keeps forever (default: 0)
    /// - LORESTORE_BACKUP_EVERY: periodic backup interval in appends
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load with priority: env > file > defaults. A missing file falls back
    /// to defaults.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration from file");
                Self::from_file(path)?
            }
            Some(path) => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields whose `LORESTORE_*` variable is set. Unparseable
    /// values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("LORESTORE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(attempts) = env_parse("LORESTORE_RETRY_ATTEMPTS") {
            self.storage.retry_attempts = attempts;
        }
        if let Some(rate) = env_parse("LORESTORE_LEARNING_RATE") {
            self.learning.learning_rate = rate;
        }
        if let Some(days) = env_parse("LORESTORE_STALE_HORIZON_DAYS") {
            self.learning.stale_horizon_days = days;
        }
        if let Some(days) = env_parse("LORESTORE_MAX_AGE_DAYS") {
            self.retention.max_age_days = days;
        }
        if let Some(every) = env_parse::<u64>("LORESTORE_BACKUP_EVERY") {
            self.storage.backup_every_appends = (every > 0).then_some(every);
        }
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        if storage.data_dir.as_os_str().is_empty() {
            return Err(config_error("storage.data_dir must not be empty"));
        }
        if storage.retry_attempts == 0 {
            return Err(config_error("storage.retry_attempts must be at least 1"));
        }
        if storage.compaction_ratio < 1 {
            return Err(config_error("storage.compaction_ratio must be at least 1"));
        }
        if storage.backup_every_appends == Some(0) {
            return Err(config_error("storage.backup_every_appends must be positive"));
        }
        if storage.max_backups == 0 {
            return Err(config_error("storage.max_backups must be at least 1"));
        }

        let learning = &self.learning;
        if !(0.0..=1.0).contains(&learning.prior) {
            return Err(config_error("learning.prior must be within [0, 1]"));
        }
        if !(learning.learning_rate > 0.0 && learning.learning_rate <= 1.0) {
            return Err(config_error("learning.learning_rate must be within (0, 1]"));
        }
        if !(learning.stale_horizon_days >= 0.0 && learning.stale_horizon_days.is_finite()) {
            return Err(config_error("learning.stale_horizon_days must be non-negative"));
        }
        if !(learning.decay_half_life_days > 0.0 && learning.decay_half_life_days.is_finite()) {
            return Err(config_error("learning.decay_half_life_days must be positive"));
        }
        if learning.base_support == 0 {
            return Err(config_error("learning.base_support must be at least 1"));
        }

        let analytics = &self.analytics;
        let similarity = &analytics.similarity;
        let weights = [
            similarity.language_weight,
            similarity.framework_weight,
            similarity.file_count_weight,
            similarity.documentation_type_weight,
            similarity.file_count_tolerance,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(config_error("analytics.similarity weights must be non-negative"));
        }
        if !(0.0..=1.0).contains(&analytics.min_similarity) {
            return Err(config_error("analytics.min_similarity must be within [0, 1]"));
        }
        if !(analytics.leiden.resolution > 0.0) {
            return Err(config_error("analytics.leiden.resolution must be positive"));
        }
        if !(analytics.anomaly.std_dev_threshold > 0.0) {
            return Err(config_error("analytics.anomaly.std_dev_threshold must be positive"));
        }
        if !(analytics.anomaly.rare_frequency > 0.0 && analytics.anomaly.rare_frequency <= 1.0) {
            return Err(config_error("analytics.anomaly.rare_frequency must be within (0, 1]"));
        }
        if analytics.recency_window_days <= 0 {
            return Err(config_error("analytics.recency_window_days must be positive"));
        }

        Ok(())
    }
}

fn config_error(message: &str) -> LorestoreError {
    LorestoreError::Config(message.to_string())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}
