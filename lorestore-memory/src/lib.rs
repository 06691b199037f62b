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

//! Lorestore Knowledge Memory
//!
//! A persistent knowledge graph about analyzed projects, the technologies
//! they use, deployment outcomes, documentation and user preferences. It
//! accumulates across many independent runs and answers relationship,
//! similarity and pattern queries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      KnowledgeMemory                          │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌─────────┐  │
//! │  │  Learning  │  │  Snapshot  │  │ Reporting  │  │ Recall  │  │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘  └────┬────┘  │
//! │        │               │               │              │       │
//! │  ┌─────▼───────────────▼───────────────▼──────────────▼────┐  │
//! │  │        Graph Index + Analytics (lorestore-index)        │  │
//! │  └───────────────────────────▲─────────────────────────────┘  │
//! │                              │ apply                          │
//! │  ┌───────────────────────────┴─────────────────────────────┐  │
//! │  │      Append-only Log + Backups (lorestore-storage)      │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use lorestore_memory::{BaseRecommendation, KnowledgeMemory, MemoryConfig, RememberMetadata};
//! use lorestore_core::{properties_from_json, EntityKind};
//!
//! fn main() -> lorestore_core::Result<()> {
//!     let memory = KnowledgeMemory::open(MemoryConfig::with_data_dir("/tmp/lorestore"))?;
//!
//!     memory.remember(
//!         EntityKind::Project,
//!         properties_from_json(serde_json::json!({"language": "go"}))?,
//!         RememberMetadata::with_id("blog"),
//!     )?;
//!     memory.learn([("language", "go")], "hugo", true)?;
//!
//!     let improved = memory.improve_recommendation(
//!         [("language", "go")],
//!         &BaseRecommendation::new("mkdocs", 0.6),
//!     );
//!     println!("{} ({:.2})", improved.recommendation, improved.confidence);
//!
//!     memory.close()
//! }
//! ```

pub mod config;
pub mod engine;
pub mod learning;
pub mod recall;
pub mod reporting;
pub mod snapshot;

// Re-exports
pub use config::{AnalyticsConfig, LearningConfig, MemoryConfig, RetentionConfig, StorageConfig};
pub use engine::{KnowledgeMemory, RememberMetadata, SimilarityQuery};
pub use learning::{
    normalize_context, signature, BaseRecommendation, Context, ImprovedRecommendation,
    Observation, Pattern, PatternEngine, PatternFilter, PatternState, PatternView,
};
pub use recall::{RecallEntry, RecallOptions, SortBy};
pub use reporting::{GraphStatistics, Granularity, HealthReport, TimelineBucket};
pub use snapshot::{
    ExportFilter, ExportFormat, ImportMode, ImportOptions, ImportPlan, ImportSummary, Snapshot,
    SNAPSHOT_FORMAT, SNAPSHOT_FORMAT_VERSION,
};
