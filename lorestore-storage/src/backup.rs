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

//! Point-in-time backups of the log files
//!
//! ```text
//! <root>/backups/<id>/entities.log
//! <root>/backups/<id>/relationships.log
//! <root>/backups/<id>/manifest.json
//! ```
//!
//! The manifest records per-stream record counts and a BLAKE3 checksum over
//! both files (file name plus contents, in stream order).

use crate::log_store::LogStore;
use chrono::{DateTime, Utc};
use lorestore_core::{LogRecord, LorestoreError, RecordStream, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const BACKUP_DIR: &str = "backups";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Backup metadata for tracking and verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    /// Directory name, sortable by creation time
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    pub entity_records: u64,
    pub relationship_records: u64,
    pub size_bytes: u64,
    /// BLAKE3 hex digest over both log files
    pub checksum: String,
}

/// Creates, lists, verifies, restores and prunes backups
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_root: PathBuf,
}

impl BackupManager {
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            backup_root: storage_root.as_ref().join(BACKUP_DIR),
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copy the current logs into a new backup directory. A failed copy
    /// leaves no partial backup behind.
    pub fn create(&self, log: &LogStore) -> Result<BackupManifest> {
        let created_at = Utc::now();
        let (id, dir) = self.allocate_dir(&created_at)?;

        let manifest = match write_backup(log, id, &dir, created_at) {
            Ok(manifest) => manifest,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %cleanup,
                        "Failed to remove partial backup"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            backup_id = %manifest.id,
            entity_records = manifest.entity_records,
            relationship_records = manifest.relationship_records,
            size_bytes = manifest.size_bytes,
            "Backup created"
        );
        Ok(manifest)
    }

    /// All readable backups, oldest first
    pub fn list(&self) -> Result<Vec<BackupManifest>> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match read_manifest(&entry.path()) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => tracing::warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Ignoring backup without a readable manifest"
                ),
            }
        }
        manifests.sort_by(|a, b| id_order(&a.id).cmp(&id_order(&b.id)));
        Ok(manifests)
    }

    pub fn manifest(&self, id: &str) -> Result<BackupManifest> {
        read_manifest(&self.dir_for(id)?)
    }

    /// True when the files still match the manifest checksum
    pub fn verify(&self, id: &str) -> Result<bool> {
        let dir = self.dir_for(id)?;
        let manifest = read_manifest(&dir)?;
        Ok(checksum_dir(&dir)? == manifest.checksum)
    }

    /// Parse a verified backup's records (strict: any bad line is an error)
    pub fn load_records(&self, id: &str) -> Result<Vec<LogRecord>> {
        let dir = self.dir_for(id)?;
        if !self.verify(id)? {
            return Err(LorestoreError::Corruption {
                path: dir,
                detail: "backup checksum mismatch".to_string(),
            });
        }

        let mut records = Vec::new();
        for stream in RecordStream::ALL {
            let path = dir.join(stream.file_name());
            let content = fs::read_to_string(&path)?;
            for (number, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record = LogRecord::from_line(line).map_err(|e| LorestoreError::Corruption {
                    path: path.clone(),
                    detail: format!("line {}: {}", number + 1, e),
                })?;
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Replace the live logs with a backup's contents
    pub fn restore(&self, id: &str, log: &mut LogStore) -> Result<BackupManifest> {
        let manifest = self.manifest(id)?;
        let records = self.load_records(id)?;
        log.replace_all(&records)?;
        tracing::info!(backup_id = %id, records = records.len(), "Restored backup");
        Ok(manifest)
    }

    /// Delete the oldest backups, keeping the newest `keep`. Returns removed ids.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        if keep == 0 {
            return Err(LorestoreError::validation(
                "keep must be at least 1 to avoid deleting every backup",
            ));
        }

        let manifests = self.list()?;
        if manifests.len() <= keep {
            return Ok(Vec::new());
        }

        let excess = manifests.len() - keep;
        let mut removed = Vec::with_capacity(excess);
        for manifest in manifests.into_iter().take(excess) {
            fs::remove_dir_all(self.backup_root.join(&manifest.id))?;
            removed.push(manifest.id);
        }

        tracing::info!(removed = removed.len(), kept = keep, "Pruned old backups");
        Ok(removed)
    }

    fn allocate_dir(&self, created_at: &DateTime<Utc>) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.backup_root)?;
        let base = created_at.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut id = base.clone();
        let mut suffix = 1;
        loop {
            let dir = self.backup_root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    id = format!("{}-{}", base, suffix);
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dir_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(LorestoreError::validation(format!("invalid backup id '{}'", id)));
        }
        let dir = self.backup_root.join(id);
        if !dir.is_dir() {
            return Err(LorestoreError::not_found(format!("backup '{}'", id)));
        }
        Ok(dir)
    }
}

fn write_backup(
    log: &LogStore,
    id: String,
    dir: &Path,
    created_at: DateTime<Utc>,
) -> Result<BackupManifest> {
    let mut size_bytes = 0;
    for stream in RecordStream::ALL {
        let source = log.path(stream);
        let target = dir.join(stream.file_name());
        if source.exists() {
            size_bytes += fs::copy(source, &target)?;
        } else {
            fs::write(&target, b"")?;
        }
    }

    let stats = log.stats();
    let manifest = BackupManifest {
        id,
        created_at,
        format_version: BACKUP_FORMAT_VERSION,
        entity_records: stats.entity_records,
        relationship_records: stats.relationship_records,
        size_bytes,
        checksum: checksum_dir(dir)?,
    };
    fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
    Ok(manifest)
}

/// Timestamp, then numeric collision suffix (`base` < `base-1` < `base-10`)
fn id_order(id: &str) -> (&str, u64) {
    match id.rsplit_once('-') {
        Some((base, suffix)) => match suffix.parse() {
            Ok(n) => (base, n),
            Err(_) => (id, 0),
        },
        None => (id, 0),
    }
}

fn read_manifest(dir: &Path) -> Result<BackupManifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn checksum_dir(dir: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    for stream in RecordStream::ALL {
        let name = stream.file_name();
        hasher.update(name.as_bytes());
        hasher.update(&fs::read(dir.join(name))?);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::LogStoreOptions;
    use lorestore_core::{Entity, EntityKind};
    use tempfile::tempdir;

    fn open(dir: &Path) -> LogStore {
        LogStore::open(
            dir,
            LogStoreOptions {
                sync_writes: false,
                ..LogStoreOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_backup_verify_restore() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&Entity::new("a", EntityKind::User).into()).unwrap();

        let backups = BackupManager::new(dir.path());
        let manifest = backups.create(&log).unwrap();
        assert_eq!(manifest.entity_records, 1);
        assert!(backups.verify(&manifest.id).unwrap());

        log.append(&Entity::new("b", EntityKind::User).into()).unwrap();
        assert_eq!(log.read_all().unwrap().records.len(), 2);

        backups.restore(&manifest.id, &mut log).unwrap();
        assert_eq!(log.read_all().unwrap().records.len(), 1);
    }

    #[test]
    fn test_tampered_backup_fails_verification() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&Entity::new("a", EntityKind::User).into()).unwrap();

        let backups = BackupManager::new(dir.path());
        let manifest = backups.create(&log).unwrap();
        let file = backups.backup_root().join(&manifest.id).join("entities.log");
        fs::write(&file, b"tampered\n").unwrap();

        assert!(!backups.verify(&manifest.id).unwrap());
        assert!(matches!(
            backups.restore(&manifest.id, &mut log),
            Err(LorestoreError::Corruption { .. })
        ));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let backups = BackupManager::new(dir.path());
        let ids: Vec<String> = (0..3).map(|_| backups.create(&log).unwrap().id).collect();

        let removed = backups.prune(1).unwrap();
        assert_eq!(removed, ids[..2].to_vec());
        let remaining = backups.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, ids[2]);
        assert!(backups.prune(0).is_err());
    }

    #[test]
    fn test_same_millisecond_backups_sort_by_suffix() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let backups = BackupManager::new(dir.path());
        let created_at = Utc::now();

        let mut ids = Vec::new();
        for _ in 0..12 {
            let (id, backup_dir) = backups.allocate_dir(&created_at).unwrap();
            write_backup(&log, id.clone(), &backup_dir, created_at).unwrap();
            ids.push(id);
        }
        assert!(ids[11].ends_with("-11"));

        let listed: Vec<String> = backups.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(listed, ids);

        let removed = backups.prune(2).unwrap();
        assert_eq!(removed, ids[..10].to_vec());
        let kept: Vec<String> = backups.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(kept, ids[10..].to_vec());
    }

    #[test]
    fn test_failed_backup_leaves_no_directory() {
        let dir = tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&Entity::new("a", EntityKind::User).into()).unwrap();

        // A directory in place of the log file makes the copy fail
        let entities = log.path(RecordStream::Entities).to_path_buf();
        fs::remove_file(&entities).unwrap();
        fs::create_dir(&entities).unwrap();

        let backups = BackupManager::new(dir.path());
        assert!(backups.create(&log).is_err());
        assert_eq!(fs::read_dir(backups.backup_root()).unwrap().count(), 0);
        assert!(backups.list().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let backups = BackupManager::new(dir.path());
        assert!(matches!(
            backups.verify("../etc"),
            Err(LorestoreError::Validation(_))
        ));
        assert!(matches!(
            backups.verify("20990101T000000.000Z"),
            Err(LorestoreError::NotFound(_))
        ));
    }
}
