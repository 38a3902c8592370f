//! Change log stored as rotating files in a directory.
//!
//! ## File Layout
//!
//! ```text
//! changelog-{base:016x}.log
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "CDCL" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - base position: u64 LE          │
//! ├──────────────────────────────────┤
//! │ Record                           │
//! │ - data_length: u32 LE            │
//! │ - position: u64 LE               │
//! │ - commit_ts: u64 LE              │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - data: [u8; data_length]        │
//! ├──────────────────────────────────┤
//! │ Record ...                       │
//! └──────────────────────────────────┘
//! ```
//!
//! Every position in a file is >= its base, and a file's base is one past
//! the head at the time it was created. Retention removes whole files.
//!
//! A torn record at the tail of the newest file is treated as not yet
//! written: readers wait, and the next writer to open the log truncates
//! it. A bad record in a sealed file is corruption.

use super::{check_resume, ChangeStream, SourceError, SourceFuture, SourceLog};
use crate::event::{Position, RawChangeRecord, StartPosition};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const LOG_MAGIC: [u8; 4] = *b"CDCL";
pub const LOG_VERSION: u8 = 1;
pub const LOG_HEADER_SIZE: usize = 16;
/// data_length(4) + position(8) + commit_ts(8) + checksum(4)
pub const RECORD_OVERHEAD: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub dir: PathBuf,
    /// Rotate once the active file reaches this size.
    pub max_file_size: u64,
    /// How often tailing readers re-check the directory.
    #[serde(with = "crate::pipeline::config::duration_millis")]
    pub poll_interval: Duration,
    /// fsync after each append.
    pub sync_on_append: bool,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        FileLogConfig {
            dir: PathBuf::from("source"),
            max_file_size: 64 * 1024 * 1024,
            poll_interval: Duration::from_millis(200),
            sync_on_append: true,
        }
    }
}

impl FileLogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLogConfig {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn test(dir: impl Into<PathBuf>) -> Self {
        FileLogConfig {
            dir: dir.into(),
            max_file_size: 4 * 1024,
            poll_interval: Duration::from_millis(10),
            sync_on_append: false,
        }
    }
}

fn checksum(position: u64, commit_ts: u64, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&position.to_le_bytes());
    hasher.update(&commit_ts.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

pub fn encode_record(record: &RawChangeRecord) -> Vec<u8> {
    let data = &record.payload;
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.position.0.to_le_bytes());
    buf.extend_from_slice(&record.commit_timestamp.to_le_bytes());
    buf.extend_from_slice(
        &checksum(record.position.0, record.commit_timestamp, data).to_le_bytes(),
    );
    buf.extend_from_slice(data);
    buf
}

/// Decode one record. `None` if truncated or the checksum does not match.
pub fn decode_record(data: &[u8]) -> Option<(RawChangeRecord, usize)> {
    if data.len() < RECORD_OVERHEAD {
        return None;
    }
    let len = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
    let position = u64::from_le_bytes(data[4..12].try_into().ok()?);
    let commit_ts = u64::from_le_bytes(data[12..20].try_into().ok()?);
    let expected = u32::from_le_bytes(data[20..24].try_into().ok()?);
    let total = RECORD_OVERHEAD.checked_add(len)?;
    if data.len() < total {
        return None;
    }
    let payload = &data[RECORD_OVERHEAD..total];
    if checksum(position, commit_ts, payload) != expected {
        return None;
    }
    Some((
        RawChangeRecord::new(Position(position), commit_ts, Bytes::copy_from_slice(payload)),
        total,
    ))
}

fn encode_header(base: Position) -> [u8; LOG_HEADER_SIZE] {
    let mut header = [0u8; LOG_HEADER_SIZE];
    header[0..4].copy_from_slice(&LOG_MAGIC);
    header[4] = LOG_VERSION;
    header[8..16].copy_from_slice(&base.0.to_le_bytes());
    header
}

fn check_header(data: &[u8], path: &Path) -> Result<(), SourceError> {
    if data.len() < LOG_HEADER_SIZE || data[0..4] != LOG_MAGIC {
        return Err(SourceError::Corrupt(format!(
            "{}: bad header",
            path.display()
        )));
    }
    if data[4] != LOG_VERSION {
        return Err(SourceError::Corrupt(format!(
            "{}: unsupported version {}",
            path.display(),
            data[4]
        )));
    }
    Ok(())
}

fn file_name(base: Position) -> String {
    format!("changelog-{:016x}.log", base.0)
}

fn parse_file_name(name: &str) -> Option<Position> {
    let hex = name.strip_prefix("changelog-")?.strip_suffix(".log")?;
    u64::from_str_radix(hex, 16).ok().map(Position)
}

/// Log files in `dir` as (base, path), ordered by base.
fn list_files(dir: &Path) -> Result<Vec<(Position, PathBuf)>, SourceError> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_file_name);
        if let Some(base) = base {
            files.push((base, path));
        }
    }
    files.sort_by_key(|(base, _)| *base);
    Ok(files)
}

/// Decode every intact record after the header. Returns the records and
/// the byte length of the valid prefix.
fn scan_file(path: &Path) -> Result<(Vec<RawChangeRecord>, usize), SourceError> {
    let data = std::fs::read(path)?;
    check_header(&data, path)?;
    let mut offset = LOG_HEADER_SIZE;
    let mut records = Vec::new();
    while let Some((record, used)) = decode_record(&data[offset..]) {
        records.push(record);
        offset += used;
    }
    Ok((records, offset))
}

fn head_of(files: &[(Position, PathBuf)]) -> Result<Option<Position>, SourceError> {
    let Some((base, path)) = files.last() else {
        return Ok(None);
    };
    let (records, _) = scan_file(path)?;
    Ok(match records.last() {
        Some(r) => Some(r.position),
        None if base.0 > 1 => Some(Position(base.0 - 1)),
        None => None,
    })
}

struct ActiveFile {
    file: std::fs::File,
    base: Position,
    size: u64,
}

struct WriterState {
    active: Option<ActiveFile>,
    head: Option<Position>,
}

/// Directory-backed change log with a single in-process writer.
#[derive(Clone)]
pub struct FileChangeLog {
    config: Arc<FileLogConfig>,
    writer: Arc<Mutex<WriterState>>,
    appended: Arc<Notify>,
}

impl FileChangeLog {
    /// Open (creating if needed). A torn tail left by a crashed writer is
    /// cut off here.
    pub fn open(config: FileLogConfig) -> Result<Self, SourceError> {
        std::fs::create_dir_all(&config.dir)?;
        let files = list_files(&config.dir)?;
        if let Some((_, path)) = files.last() {
            let (_, valid_len) = scan_file(path)?;
            let actual = std::fs::metadata(path)?.len();
            if actual > valid_len as u64 {
                warn!(
                    file = %path.display(),
                    dropped_bytes = actual - valid_len as u64,
                    "Truncating torn tail of change log"
                );
                let file = std::fs::OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
        }
        let head = head_of(&files)?;
        info!(dir = %config.dir.display(), files = files.len(), head = ?head, "Opened file change log");
        Ok(FileChangeLog {
            config: Arc::new(config),
            writer: Arc::new(Mutex::new(WriterState { active: None, head })),
            appended: Arc::new(Notify::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn create_file(&self, base: Position) -> Result<ActiveFile, SourceError> {
        let path = self.config.dir.join(file_name(base));
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        file.write_all(&encode_header(base))?;
        file.sync_all()?;
        debug!(file = %path.display(), "Created change log file");
        Ok(ActiveFile {
            file,
            base,
            size: LOG_HEADER_SIZE as u64,
        })
    }

    fn reopen_last(&self) -> Result<Option<ActiveFile>, SourceError> {
        let files = list_files(&self.config.dir)?;
        let Some((base, path)) = files.last() else {
            return Ok(None);
        };
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Some(ActiveFile {
            file,
            base: *base,
            size,
        }))
    }

    /// Append a record at the next position.
    pub fn append(&self, payload: &[u8], commit_timestamp: u64) -> Result<Position, SourceError> {
        let position = {
            let mut state = self.writer.lock();
            let position = state.head.unwrap_or(Position::ZERO).next();

            if state.active.is_none() {
                state.active = self.reopen_last()?;
            }
            let rotate = match &state.active {
                Some(active) => active.size >= self.config.max_file_size,
                None => true,
            };
            if rotate {
                if let Some(old) = &state.active {
                    debug!(base = %old.base, size = old.size, "Rotating change log file");
                }
                state.active = Some(self.create_file(position)?);
            }

            let record = RawChangeRecord::new(position, commit_timestamp, Bytes::copy_from_slice(payload));
            let encoded = encode_record(&record);
            let sync = self.config.sync_on_append;
            let Some(active) = state.active.as_mut() else {
                return Err(SourceError::Corrupt("no active change log file".into()));
            };
            active.file.write_all(&encoded)?;
            if sync {
                active.file.sync_data()?;
            }
            active.size += encoded.len() as u64;
            state.head = Some(position);
            position
        };
        self.appended.notify_waiters();
        Ok(position)
    }

    /// Delete whole files whose records are all below `position`.
    pub fn truncate_before(&self, position: Position) -> Result<usize, SourceError> {
        let files = list_files(&self.config.dir)?;
        let mut removed = 0;
        for pair in files.windows(2) {
            let (_, path) = &pair[0];
            let (next_base, _) = &pair[1];
            if *next_base > position {
                break;
            }
            std::fs::remove_file(path)?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, before = %position, "Removed change log files");
        }
        Ok(removed)
    }
}

impl SourceLog for FileChangeLog {
    fn open_stream(&self, start: StartPosition) -> SourceFuture<'_, Box<dyn ChangeStream>> {
        Box::pin(async move {
            let files = list_files(&self.config.dir)?;
            let head = head_of(&files)?;
            let after = match start {
                StartPosition::Earliest => None,
                StartPosition::Head => head,
                StartPosition::At(p) => {
                    check_resume(p, files.first().map(|(b, _)| *b), head)?;
                    Some(p)
                }
            };
            let stream: Box<dyn ChangeStream> = Box::new(FileStream {
                dir: self.config.dir.clone(),
                poll_interval: self.config.poll_interval,
                appended: self.appended.clone(),
                after,
                current: None,
                offset: 0,
                pending: VecDeque::new(),
            });
            Ok(stream)
        })
    }

    fn current_head_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move {
            let files = list_files(&self.config.dir)?;
            head_of(&files)
        })
    }

    fn earliest_retained_position(&self) -> SourceFuture<'_, Option<Position>> {
        Box::pin(async move {
            let files = list_files(&self.config.dir)?;
            Ok(files.first().map(|(base, _)| *base))
        })
    }
}

struct FileStream {
    dir: PathBuf,
    poll_interval: Duration,
    appended: Arc<Notify>,
    after: Option<Position>,
    /// Base of the file being read.
    current: Option<Position>,
    offset: u64,
    pending: VecDeque<RawChangeRecord>,
}

impl FileStream {
    /// File that holds the record after `self.after`.
    fn locate(&self, files: &[(Position, PathBuf)]) -> Result<Option<Position>, SourceError> {
        let Some((earliest, _)) = files.first() else {
            return Ok(None);
        };
        let want = self.after.map(|a| a.next()).unwrap_or(*earliest);
        if let Some(after) = self.after {
            if want < *earliest {
                return Err(SourceError::PositionLost {
                    requested: after,
                    earliest: *earliest,
                });
            }
        }
        Ok(files
            .iter()
            .rev()
            .find(|(base, _)| *base <= want)
            .map(|(base, _)| *base)
            .or(Some(*earliest)))
    }

    /// Pull newly written records into `pending`. True if progress was made.
    async fn fill(&mut self) -> Result<bool, SourceError> {
        let files = list_files(&self.dir)?;
        let current = match self.current {
            Some(base) if files.iter().any(|(b, _)| *b == base) => base,
            _ => {
                let Some(base) = self.locate(&files)? else {
                    return Ok(false);
                };
                self.current = Some(base);
                self.offset = 0;
                base
            }
        };
        let path = self.dir.join(file_name(current));

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.current = None;
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };
        if self.offset == 0 {
            let mut header = [0u8; LOG_HEADER_SIZE];
            match file.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            check_header(&header, &path)?;
            self.offset = LOG_HEADER_SIZE as u64;
        }
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut used = 0;
        while let Some((record, n)) = decode_record(&buf[used..]) {
            used += n;
            self.pending.push_back(record);
        }
        self.offset += used as u64;
        if used > 0 {
            return Ok(true);
        }

        let next = files.iter().find(|(base, _)| *base > current);
        match next {
            Some((next_base, _)) => {
                if !buf.is_empty() {
                    return Err(SourceError::Corrupt(format!(
                        "{}: {} undecodable bytes at offset {}",
                        path.display(),
                        buf.len(),
                        self.offset
                    )));
                }
                self.current = Some(*next_base);
                self.offset = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ChangeStream for FileStream {
    fn next_record(&mut self) -> SourceFuture<'_, RawChangeRecord> {
        Box::pin(async move {
            loop {
                while let Some(record) = self.pending.pop_front() {
                    if self.after.map_or(true, |a| record.position > a) {
                        self.after = Some(record.position);
                        return Ok(record);
                    }
                }
                let appended = self.appended.clone();
                let notified = appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.fill().await? {
                    continue;
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_frame_roundtrip_and_corruption() {
        let record = RawChangeRecord::new(Position(9), 1234, Bytes::from_static(b"payload"));
        let mut encoded = encode_record(&record);
        let (decoded, used) = decode_record(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(used, encoded.len());

        assert!(decode_record(&encoded[..encoded.len() - 1]).is_none());
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(decode_record(&encoded).is_none());
    }

    #[test]
    fn test_file_name_roundtrip() {
        assert_eq!(parse_file_name(&file_name(Position(42))), Some(Position(42)));
        assert_eq!(parse_file_name("other.log"), None);
    }

    #[tokio::test]
    async fn test_append_and_read_across_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileChangeLog::open(FileLogConfig::test(dir.path())).unwrap();
        let payload = vec![b'x'; 500];
        for i in 0..30 {
            assert_eq!(log.append(&payload, i).unwrap(), Position(i + 1));
        }
        assert!(list_files(dir.path()).unwrap().len() > 1, "should have rotated");

        let mut stream = log.open_stream(StartPosition::Earliest).await.unwrap();
        for expected in 1..=30u64 {
            let record = stream.next_record().await.unwrap();
            assert_eq!(record.position, Position(expected));
        }
    }

    #[tokio::test]
    async fn test_resume_after_position() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileChangeLog::open(FileLogConfig::test(dir.path())).unwrap();
        for i in 0..10 {
            log.append(format!("r{}", i).as_bytes(), 0).unwrap();
        }
        let mut stream = log.open_stream(StartPosition::At(Position(7))).await.unwrap();
        assert_eq!(stream.next_record().await.unwrap().position, Position(8));
    }

    #[tokio::test]
    async fn test_reopen_truncates_torn_tail_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileChangeLog::open(FileLogConfig::test(dir.path())).unwrap();
            log.append(b"one", 0).unwrap();
            log.append(b"two", 0).unwrap();
        }
        let (_, path) = list_files(dir.path()).unwrap().pop().unwrap();
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7, 0, 0, 0, 1, 2]).unwrap();

        let log = FileChangeLog::open(FileLogConfig::test(dir.path())).unwrap();
        assert_eq!(log.append(b"three", 0).unwrap(), Position(3));
        let mut stream = log.open_stream(StartPosition::At(Position(2))).await.unwrap();
        let record = stream.next_record().await.unwrap();
        assert_eq!(record.payload, Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn test_retention_and_position_lost() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileChangeLog::open(FileLogConfig::test(dir.path())).unwrap();
        let payload = vec![b'y'; 1000];
        for _ in 0..20 {
            log.append(&payload, 0).unwrap();
        }
        let removed = log.truncate_before(Position(15)).unwrap();
        assert!(removed > 0);
        let earliest = log.earliest_retained_position().await.unwrap().unwrap();
        assert!(earliest > Position(1) && earliest <= Position(15));

        let err = log
            .open_stream(StartPosition::At(Position(0)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::PositionLost { .. }));
    }

    #[tokio::test]
    async fn test_tailing_reader_sees_new_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileChangeLog::open(FileLogConfig::test(dir.path())).unwrap();
        let mut stream = log.open_stream(StartPosition::Earliest).await.unwrap();
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(b"late", 5).unwrap();
        });
        let record = tokio::time::timeout(Duration::from_secs(2), stream.next_record())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.commit_timestamp, 5);
    }
}
