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

//! Knowledge-graph memory error types

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, LorestoreError>;

/// Errors that can occur in the knowledge-graph memory
///
/// Budget overruns in analytics are not errors: they come back as a
/// partial result with a `truncated` flag.
#[derive(Debug, Error)]
pub enum LorestoreError {
    /// Malformed record or query, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity or relationship is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Log could not be recovered
    #[error("Corrupt store at {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },

    /// Snapshot produced by a newer, unsupported format
    #[error("Incompatible snapshot format version {found} (supported up to {supported})")]
    IncompatibleVersion { found: u32, supported: u32 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LorestoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        LorestoreError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        LorestoreError::NotFound(message.into())
    }

    /// True for errors the caller caused (bad input or missing references)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LorestoreError::Validation(_)
                | LorestoreError::NotFound(_)
                | LorestoreError::IncompatibleVersion { .. }
        )
    }
}

impl From<serde_json::Error> for LorestoreError {
    fn from(e: serde_json::Error) -> Self {
        LorestoreError::Serialization(e.to_string())
    }
}
