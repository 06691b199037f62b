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

//! Lorestore Storage Layer
//!
//! Durable JSON-lines logs for the knowledge graph.
//!
//! ## Architecture
//!
//! - **Log Store**: append-only entity and relationship logs with torn-tail
//!   recovery and atomic (temp file + rename) compaction
//! - **Backups**: checksummed point-in-time copies of both logs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lorestore_storage::{LogStore, LogStoreOptions};
//!
//! let mut log = LogStore::open("/var/lib/lorestore", LogStoreOptions::default())?;
//! log.append(&entity.into())?;
//! let report = log.read_all()?;
//! ```

pub mod backup;
pub mod log_store;

pub use backup::{BackupManager, BackupManifest, BACKUP_DIR, BACKUP_FORMAT_VERSION};
pub use log_store::{
    LoadReport, LogStats, LogStore, LogStoreOptions, RecoverySummary,
    DEFAULT_COMPACTION_MIN_RECORDS, DEFAULT_COMPACTION_RATIO,
};
