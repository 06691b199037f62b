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

//! Append-only Log Store
//!
//! Two JSON-lines files under the storage root, one per record stream:
//!
//! ```text
//! <root>/entities.log
//! <root>/relationships.log
//! ```
//!
//! Every append writes one complete line and flushes it. On open, a torn
//! trailing line (a write interrupted by a crash) is discarded and the file is
//! truncated back to the last good record boundary so later appends start on
//! a clean line. Unparseable lines in the middle of a file are skipped and
//! counted. A store whose logs hold unparseable middle lines and no readable
//! record at all is reported as corruption.
//!
//! Compaction rewrites each stream into a temp file and renames it over the
//! original, so readers observe either the old or the new file.

use lorestore_core::{
    LogRecord, LorestoreError, RecordId, RecordIdentity, RecordStream, Result, RetryPolicy,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Compact when total records exceed this multiple of live records
pub const DEFAULT_COMPACTION_RATIO: u64 = 2;

/// Minimum total records before considering compaction
pub const DEFAULT_COMPACTION_MIN_RECORDS: u64 = 10_000;

/// Log store tuning
#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    pub retry: RetryPolicy,
    pub compaction_ratio: u64,
    pub compaction_min_records: u64,
    /// fsync after every append and rewrite
    pub sync_writes: bool,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(),
            compaction_ratio: DEFAULT_COMPACTION_RATIO,
            compaction_min_records: DEFAULT_COMPACTION_MIN_RECORDS,
            sync_writes: true,
        }
    }
}

/// Result of replaying both logs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Entity records first, then relationship records, each in append order
    pub records: Vec<LogRecord>,
    /// Torn trailing lines dropped
    pub discarded_trailing: usize,
    /// Unparseable lines skipped in the middle of a file
    pub skipped_corrupt: usize,
}

/// Recovery actions taken when the store was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub discarded_trailing: usize,
    pub skipped_corrupt: usize,
    pub truncated_bytes: u64,
}

/// Record counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub entity_records: u64,
    pub relationship_records: u64,
    pub live_entities: u64,
    pub live_relationships: u64,
}

impl LogStats {
    pub fn total(&self) -> u64 {
        self.entity_records + self.relationship_records
    }

    pub fn live(&self) -> u64 {
        self.live_entities + self.live_relationships
    }
}

#[derive(Debug)]
struct StreamFile {
    path: PathBuf,
    /// Byte length of the file as last written by us
    len: u64,
    records: u64,
}

#[derive(Debug, Default)]
struct StreamScan {
    records: Vec<LogRecord>,
    good_len: u64,
    file_len: u64,
    needs_newline: bool,
    discarded_trailing: usize,
    skipped_corrupt: usize,
}

/// Durable, append-only record log
#[derive(Debug)]
pub struct LogStore {
    root: PathBuf,
    options: LogStoreOptions,
    entities: StreamFile,
    relationships: StreamFile,
    live: HashSet<RecordIdentity>,
    recovery: RecoverySummary,
}

impl LogStore {
    /// Open (or create) the logs under `root`, repairing torn tails.
    pub fn open(root: impl AsRef<Path>, options: LogStoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let entity_scan = scan_stream(&root, RecordStream::Entities)?;
        let relationship_scan = scan_stream(&root, RecordStream::Relationships)?;
        ensure_readable(&root, &[&entity_scan, &relationship_scan])?;

        let mut recovery = RecoverySummary::default();
        let mut live = HashSet::new();
        let entities =
            open_stream(&root, RecordStream::Entities, entity_scan, &mut recovery, &mut live)?;
        let relationships = open_stream(
            &root,
            RecordStream::Relationships,
            relationship_scan,
            &mut recovery,
            &mut live,
        )?;

        let store = Self {
            root,
            options,
            entities,
            relationships,
            live,
            recovery,
        };

        let stats = store.stats();
        info!(
            path = %store.root.display(),
            entity_records = stats.entity_records,
            relationship_records = stats.relationship_records,
            discarded_trailing = recovery.discarded_trailing,
            skipped_corrupt = recovery.skipped_corrupt,
            "Opened log store"
        );

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, stream: RecordStream) -> &Path {
        match stream {
            RecordStream::Entities => &self.entities.path,
            RecordStream::Relationships => &self.relationships.path,
        }
    }

    pub fn options(&self) -> &LogStoreOptions {
        &self.options
    }

    /// What the last open had to repair
    pub fn recovery(&self) -> RecoverySummary {
        self.recovery
    }

    /// Append one record. Validation happens before any byte is written; a
    /// failed write is truncated away and retried.
    pub fn append(&mut self, record: &LogRecord) -> Result<RecordId> {
        record.validate()?;

        let mut line = record.to_line()?;
        line.push('\n');

        let stream = record.stream();
        let sync = self.options.sync_writes;
        let retry = &self.options.retry;
        let file = match stream {
            RecordStream::Entities => &mut self.entities,
            RecordStream::Relationships => &mut self.relationships,
        };

        let expected_len = file.len;
        retry.run("log append", |_| {
            write_line(&file.path, expected_len, line.as_bytes(), sync)
        })?;

        file.len += line.len() as u64;
        let sequence = file.records;
        file.records += 1;
        self.live.insert(record.identity());

        debug!(stream = %stream, sequence, "Appended record");
        Ok(RecordId { stream, sequence })
    }

    /// Replay both logs: entities first, then relationships.
    pub fn read_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for stream in RecordStream::ALL {
            let scan = scan_stream(&self.root, stream)?;
            report.discarded_trailing += scan.discarded_trailing;
            report.skipped_corrupt += scan.skipped_corrupt;
            report.records.extend(scan.records);
        }
        Ok(report)
    }

    pub fn stats(&self) -> LogStats {
        let live_entities = self
            .live
            .iter()
            .filter(|id| matches!(id, RecordIdentity::Entity(_)))
            .count() as u64;
        LogStats {
            entity_records: self.entities.records,
            relationship_records: self.relationships.records,
            live_entities,
            live_relationships: self.live.len() as u64 - live_entities,
        }
    }

    /// Compact when superseded records outweigh live ones
    ///
    /// total > ratio × live AND total > minimum
    pub fn should_compact(&self) -> bool {
        let stats = self.stats();
        stats.total() > self.options.compaction_min_records
            && stats.total() > stats.live() * self.options.compaction_ratio
    }

    /// Rewrite both logs keeping only records for which `keep` returns true.
    /// Returns the number of records removed.
    pub fn compact<F>(&mut self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&LogRecord) -> bool,
    {
        let report = self.read_all()?;
        let before = report.records.len();
        let kept: Vec<LogRecord> = report.records.into_iter().filter(|r| keep(r)).collect();
        let removed = before - kept.len();

        self.rewrite(&kept)?;
        info!(removed, remaining = kept.len(), "Compacted log store");
        Ok(removed)
    }

    /// Keep only the latest record per entity id and per relationship triple
    pub fn compact_latest(&mut self) -> Result<usize> {
        let report = self.read_all()?;
        let mut latest: HashMap<RecordIdentity, usize> = HashMap::with_capacity(report.records.len());
        for (position, record) in report.records.iter().enumerate() {
            latest.insert(record.identity(), position);
        }

        let before = report.records.len();
        let kept: Vec<LogRecord> = report
            .records
            .into_iter()
            .enumerate()
            .filter(|(position, record)| latest.get(&record.identity()) == Some(position))
            .map(|(_, record)| record)
            .collect();
        let removed = before - kept.len();

        self.rewrite(&kept)?;
        info!(removed, remaining = kept.len(), "Compacted log store to latest records");
        Ok(removed)
    }

    /// Atomically replace the whole log contents
    pub fn replace_all(&mut self, records: &[LogRecord]) -> Result<()> {
        for record in records {
            record.validate()?;
        }
        self.rewrite(records)?;
        info!(records = records.len(), "Replaced log contents");
        Ok(())
    }

    fn rewrite(&mut self, records: &[LogRecord]) -> Result<()> {
        let mut entity_lines = Vec::new();
        let mut relationship_lines = Vec::new();
        for record in records {
            let line = record.to_line()?;
            match record.stream() {
                RecordStream::Entities => entity_lines.push(line),
                RecordStream::Relationships => relationship_lines.push(line),
            }
        }

        let sync = self.options.sync_writes;
        let entities_len = self
            .options
            .retry
            .run("log rewrite", |_| write_atomically(&self.entities.path, &entity_lines, sync))?;
        let relationships_len = self.options.retry.run("log rewrite", |_| {
            write_atomically(&self.relationships.path, &relationship_lines, sync)
        })?;

        self.entities.len = entities_len;
        self.entities.records = entity_lines.len() as u64;
        self.relationships.len = relationships_len;
        self.relationships.records = relationship_lines.len() as u64;
        self.live = records.iter().map(LogRecord::identity).collect();
        Ok(())
    }
}

/// Torn tails are repaired on open. Only unreadable lines in the middle of a
/// log, with no readable record anywhere in the store, make it unopenable.
fn ensure_readable(root: &Path, scans: &[&StreamScan]) -> Result<()> {
    let readable: usize = scans.iter().map(|s| s.records.len()).sum();
    let skipped: usize = scans.iter().map(|s| s.skipped_corrupt).sum();
    if readable == 0 && skipped > 0 {
        let discarded: usize = scans.iter().map(|s| s.discarded_trailing).sum();
        return Err(LorestoreError::Corruption {
            path: root.to_path_buf(),
            detail: format!("none of {} records could be read", skipped + discarded),
        });
    }
    Ok(())
}

fn open_stream(
    root: &Path,
    stream: RecordStream,
    scan: StreamScan,
    recovery: &mut RecoverySummary,
    live: &mut HashSet<RecordIdentity>,
) -> Result<StreamFile> {
    let path = root.join(stream.file_name());

    let mut len = scan.good_len;
    if scan.good_len < scan.file_len || scan.needs_newline {
        len = repair_tail(&path, &scan)?;
        recovery.truncated_bytes += scan.file_len.saturating_sub(scan.good_len);
    }
    recovery.discarded_trailing += scan.discarded_trailing;
    recovery.skipped_corrupt += scan.skipped_corrupt;

    live.extend(scan.records.iter().map(LogRecord::identity));
    Ok(StreamFile {
        path,
        len,
        records: scan.records.len() as u64,
    })
}

fn scan_stream(root: &Path, stream: RecordStream) -> Result<StreamScan> {
    let path = root.join(stream.file_name());
    let path = path.as_path();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StreamScan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut scan = StreamScan {
        file_len: bytes.len() as u64,
        ..StreamScan::default()
    };
    let mut offset = 0usize;
    let mut line_number = 0usize;

    while offset < bytes.len() {
        let newline = bytes[offset..].iter().position(|b| *b == b'\n');
        let (line_end, next) = match newline {
            Some(p) => (offset + p, offset + p + 1),
            None => (bytes.len(), bytes.len()),
        };
        let line = &bytes[offset..line_end];
        let is_last = next >= bytes.len();
        line_number += 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            if newline.is_some() {
                scan.good_len = next as u64;
            }
            offset = next;
            continue;
        }

        match parse_line(line, stream) {
            Ok(record) => {
                scan.records.push(record);
                scan.good_len = next as u64;
                scan.needs_newline = newline.is_none();
            }
            Err(detail) if is_last => {
                warn!(
                    path = %path.display(),
                    line = line_number,
                    error = %detail,
                    "Discarding torn trailing record"
                );
                scan.discarded_trailing += 1;
            }
            Err(detail) => {
                warn!(
                    path = %path.display(),
                    line = line_number,
                    error = %detail,
                    "Skipping unreadable record"
                );
                scan.skipped_corrupt += 1;
                scan.good_len = next as u64;
            }
        }
        offset = next;
    }

    Ok(scan)
}

fn parse_line(line: &[u8], stream: RecordStream) -> std::result::Result<LogRecord, String> {
    let text = std::str::from_utf8(line).map_err(|e| e.to_string())?;
    let record = LogRecord::from_line(text).map_err(|e| e.to_string())?;
    if record.stream() != stream {
        return Err(format!("{} record found in the {} log", record.stream(), stream));
    }
    Ok(record)
}

/// Truncate a stream to its last good boundary and terminate the final line
fn repair_tail(path: &Path, scan: &StreamScan) -> Result<u64> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(scan.good_len)?;
    let mut len = scan.good_len;
    if scan.needs_newline {
        use std::io::Seek;
        file.seek(io::SeekFrom::End(0))?;
        file.write_all(b"\n")?;
        len += 1;
    }
    file.sync_all()?;
    warn!(
        path = %path.display(),
        kept_bytes = len,
        dropped_bytes = scan.file_len.saturating_sub(scan.good_len),
        "Repaired log tail"
    );
    Ok(len)
}

fn write_line(path: &Path, expected_len: u64, bytes: &[u8], sync: bool) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    // A previous failed attempt may have left a partial line behind
    if file.metadata()?.len() != expected_len {
        file.set_len(expected_len)?;
    }

    let written = file.write_all(bytes).and_then(|_| file.flush()).and_then(|_| {
        if sync {
            file.sync_data()
        } else {
            Ok(())
        }
    });

    if let Err(e) = written {
        if let Err(truncate_err) = file.set_len(expected_len) {
            warn!(
                path = %path.display(),
                error = %truncate_err,
                "Failed to roll back partial append"
            );
        }
        return Err(e.into());
    }
    Ok(())
}

fn write_atomically(path: &Path, lines: &[String], sync: bool) -> Result<u64> {
    let tmp = path.with_extension("log.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for line in lines {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(fs::metadata(path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorestore_core::{Entity, EntityKind, RelationType, Relationship};
    use tempfile::tempdir;

    fn options() -> LogStoreOptions {
        LogStoreOptions {
            sync_writes: false,
            ..LogStoreOptions::default()
        }
    }

    fn entity(id: &str) -> LogRecord {
        Entity::new(id, EntityKind::Project)
            .with_property("language", "rust")
            .into()
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), options()).unwrap();

        let first = store.append(&entity("a")).unwrap();
        store.append(&entity("b")).unwrap();
        let edge = store
            .append(&Relationship::new("a", "b", RelationType::SimilarTo).into())
            .unwrap();

        assert_eq!(first, RecordId { stream: RecordStream::Entities, sequence: 0 });
        assert_eq!(edge.stream, RecordStream::Relationships);

        let report = store.read_all().unwrap();
        assert_eq!(report.records.len(), 3);
        assert!(report.records[2].as_relationship().is_some());
        assert_eq!(report.discarded_trailing, 0);
    }

    #[test]
    fn test_invalid_record_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), options()).unwrap();
        let bad = Relationship::new("a", "b", RelationType::DependsOn).with_weight(2.0);
        assert!(store.append(&bad.into()).is_err());
        assert!(!store.path(RecordStream::Relationships).exists());
        assert_eq!(store.stats().total(), 0);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), options()).unwrap();
            store.append(&entity("a")).unwrap();
            store.append(&entity("b")).unwrap();
        }
        let path = dir.path().join("entities.log");
        let good_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"recordType":"entity","id":"c","ki"#).unwrap();
        drop(file);

        let mut store = LogStore::open(dir.path(), options()).unwrap();
        assert_eq!(store.recovery().discarded_trailing, 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        store.append(&entity("d")).unwrap();
        let report = store.read_all().unwrap();
        let ids: Vec<_> = report
            .records
            .iter()
            .filter_map(|r| r.as_entity().map(|e| e.id.as_str()))
            .collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_unterminated_valid_line_is_kept() {
        let dir = tempdir().unwrap();
        let line = entity("solo").to_line().unwrap();
        fs::write(dir.path().join("entities.log"), &line).unwrap();

        let mut store = LogStore::open(dir.path(), options()).unwrap();
        store.append(&entity("next")).unwrap();
        assert_eq!(store.read_all().unwrap().records.len(), 2);
    }

    #[test]
    fn test_mid_file_garbage_is_skipped() {
        let dir = tempdir().unwrap();
        let content = format!(
            "{}\nnot json at all\n{}\n",
            entity("a").to_line().unwrap(),
            entity("b").to_line().unwrap()
        );
        fs::write(dir.path().join("entities.log"), content).unwrap();

        let store = LogStore::open(dir.path(), options()).unwrap();
        assert_eq!(store.recovery().skipped_corrupt, 1);
        let report = store.read_all().unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.skipped_corrupt, 1);
    }

    #[test]
    fn test_lone_torn_record_is_repaired() {
        let dir = tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), options()).unwrap();
            store.append(&entity("a")).unwrap();
            store.append(&entity("b")).unwrap();
        }
        let path = dir.path().join("relationships.log");
        fs::write(&path, br#"{"recordType":"relationship","sourceId":"a","targ"#).unwrap();

        let mut store = LogStore::open(dir.path(), options()).unwrap();
        assert_eq!(store.recovery().discarded_trailing, 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(store.stats().entity_records, 2);
        assert_eq!(store.stats().relationship_records, 0);

        store
            .append(&Relationship::new("a", "b", RelationType::DependsOn).into())
            .unwrap();
        assert_eq!(store.read_all().unwrap().records.len(), 3);
    }

    #[test]
    fn test_torn_first_append_opens_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("entities.log"), br#"{"recordType":"ent"#).unwrap();
        let store = LogStore::open(dir.path(), options()).unwrap();
        assert_eq!(store.recovery().discarded_trailing, 1);
        assert_eq!(store.stats().total(), 0);
    }

    #[test]
    fn test_fully_unreadable_log_is_corruption() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("entities.log"), "garbage\nmore garbage\nstill\n").unwrap();
        let err = LogStore::open(dir.path(), options()).unwrap_err();
        assert!(matches!(err, LorestoreError::Corruption { .. }));
    }

    #[test]
    fn test_compact_latest_keeps_last_record_per_identity() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), options()).unwrap();
        for _ in 0..3 {
            store.append(&entity("a")).unwrap();
        }
        store.append(&entity("b")).unwrap();
        for weight in [0.2, 0.9] {
            store
                .append(&Relationship::new("a", "b", RelationType::SimilarTo).with_weight(weight).into())
                .unwrap();
        }

        assert_eq!(store.stats().total(), 6);
        assert_eq!(store.stats().live(), 3);

        let removed = store.compact_latest().unwrap();
        assert_eq!(removed, 3);
        let report = store.read_all().unwrap();
        assert_eq!(report.records.len(), 3);
        let edge = report.records[2].as_relationship().unwrap();
        assert_eq!(edge.weight, 0.9);

        // Appends after a rewrite land on a clean line
        store.append(&entity("c")).unwrap();
        assert_eq!(store.read_all().unwrap().records.len(), 4);
    }

    #[test]
    fn test_compact_with_predicate() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(dir.path(), options()).unwrap();
        store.append(&entity("keep")).unwrap();
        store.append(&entity("drop")).unwrap();

        let removed = store
            .compact(|r| r.as_entity().map_or(true, |e| e.id != "drop"))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().live_entities, 1);
    }

    #[test]
    fn test_should_compact_respects_minimum() {
        let dir = tempdir().unwrap();
        let mut store = LogStore::open(
            dir.path(),
            LogStoreOptions {
                compaction_min_records: 4,
                ..options()
            },
        )
        .unwrap();
        for _ in 0..4 {
            store.append(&entity("same")).unwrap();
        }
        assert!(!store.should_compact());
        store.append(&entity("same")).unwrap();
        assert!(store.should_compact());
    }
}
