//! Append-only change history sink.
//!
//! Every event becomes an immutable record carrying the operation and both
//! images. Records at or below the log's last appended position are
//! skipped, which keeps the history free of duplicates across replays.

use super::{after_watermark, SinkFuture, SinkKind, SinkWriter};
use crate::event::{ChangeEvent, Operation, Position, Row, TableId};
use crate::router::SinkId;
use crate::store::{SharedStore, StoreFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRecord {
    pub position: Position,
    pub table: TableId,
    pub operation: Operation,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub commit_timestamp: u64,
}

impl From<&ChangeEvent> for AppendRecord {
    fn from(event: &ChangeEvent) -> Self {
        AppendRecord {
            position: event.source_position,
            table: event.table_id.clone(),
            operation: event.operation,
            before: event.before_image.clone(),
            after: event.after_image.clone(),
            commit_timestamp: event.commit_timestamp,
        }
    }
}

/// Append-only destination.
pub trait AppendLog: Send + Sync + 'static {
    /// Stage records past the last appended position. Returns how many
    /// were taken.
    fn append<'a>(&'a self, records: &'a [AppendRecord]) -> StoreFuture<'a, usize>;

    /// Make staged records durable. Returns the durable tail position.
    fn commit(&self) -> StoreFuture<'_, Option<Position>>;

    fn last_durable(&self) -> StoreFuture<'_, Option<Position>>;
}

impl<T: AppendLog + ?Sized> AppendLog for Arc<T> {
    fn append<'a>(&'a self, records: &'a [AppendRecord]) -> StoreFuture<'a, usize> {
        (**self).append(records)
    }

    fn commit(&self) -> StoreFuture<'_, Option<Position>> {
        (**self).commit()
    }

    fn last_durable(&self) -> StoreFuture<'_, Option<Position>> {
        (**self).last_durable()
    }
}

#[derive(Debug, Default)]
struct AppendState {
    durable: Vec<AppendRecord>,
    staged: Vec<AppendRecord>,
}

impl AppendState {
    fn tail(&self) -> Option<Position> {
        self.staged
            .last()
            .or(self.durable.last())
            .map(|record| record.position)
    }

    fn durable_tail(&self) -> Option<Position> {
        self.durable.last().map(|record| record.position)
    }

    fn stage(&mut self, records: &[AppendRecord]) -> usize {
        let mut taken = 0;
        for record in records {
            if self.tail().map_or(true, |tail| record.position > tail) {
                self.staged.push(record.clone());
                taken += 1;
            }
        }
        taken
    }
}

/// In-memory append log. Clones share state; `crash()` drops staged records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAppendLog {
    inner: Arc<Mutex<AppendState>>,
}

impl InMemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable records in append order.
    pub fn records(&self) -> Vec<AppendRecord> {
        self.inner.lock().durable.clone()
    }

    pub fn crash(&self) {
        self.inner.lock().staged.clear();
    }
}

impl AppendLog for InMemoryAppendLog {
    fn append<'a>(&'a self, records: &'a [AppendRecord]) -> StoreFuture<'a, usize> {
        Box::pin(async move { Ok(self.inner.lock().stage(records)) })
    }

    fn commit(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            let staged = std::mem::take(&mut state.staged);
            state.durable.extend(staged);
            Ok(state.durable_tail())
        })
    }

    fn last_durable(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.inner.lock().durable_tail()) })
    }
}

/// Append log stored as immutable segment objects.
///
/// Each commit writes one object `{prefix}/{first:020}-{last:020}.seg`
/// holding a CRC32 followed by the bincode-encoded records. The durable
/// tail is recovered from the highest segment name.
pub struct ObjectStoreAppendLog {
    store: SharedStore,
    prefix: String,
    staged: Mutex<Vec<AppendRecord>>,
    tail: Mutex<Option<Option<Position>>>,
}

impl ObjectStoreAppendLog {
    pub fn new(store: SharedStore, prefix: &str) -> Self {
        ObjectStoreAppendLog {
            store,
            prefix: prefix.to_string(),
            staged: Mutex::new(Vec::new()),
            tail: Mutex::new(None),
        }
    }

    fn segment_key(&self, first: Position, last: Position) -> String {
        format!("{}/{:020}-{:020}.seg", self.prefix, first.0, last.0)
    }

    fn parse_last(key: &str) -> Option<Position> {
        let name = key.rsplit('/').next()?.strip_suffix(".seg")?;
        let (_, last) = name.split_once('-')?;
        last.parse().ok().map(Position)
    }

    async fn segment_keys(&self) -> std::io::Result<Vec<String>> {
        let prefix = format!("{}/", self.prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.store.list(&prefix, token.as_deref()).await?;
            keys.extend(
                page.objects
                    .into_iter()
                    .map(|meta| meta.key)
                    .filter(|key| key.ends_with(".seg")),
            );
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn durable_tail(&self) -> std::io::Result<Option<Position>> {
        let cached = *self.tail.lock();
        if let Some(tail) = cached {
            return Ok(tail);
        }
        let tail = self
            .segment_keys()
            .await?
            .iter()
            .filter_map(|key| Self::parse_last(key))
            .max();
        *self.tail.lock() = Some(tail);
        Ok(tail)
    }

    /// All durable records, verifying each segment checksum.
    pub async fn read_all(&self) -> std::io::Result<Vec<AppendRecord>> {
        let mut records = Vec::new();
        for key in self.segment_keys().await? {
            let bytes = self.store.get(&key).await?;
            records.extend(decode_segment(&bytes)?);
        }
        Ok(records)
    }
}

fn encode_segment(records: &[AppendRecord]) -> std::io::Result<Vec<u8>> {
    let body =
        bincode::serialize(records).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
    let mut bytes = Vec::with_capacity(body.len() + 4);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode_segment(bytes: &[u8]) -> std::io::Result<Vec<AppendRecord>> {
    if bytes.len() < 4 {
        return Err(IoError::new(ErrorKind::InvalidData, "segment too short"));
    }
    let (crc, body) = bytes.split_at(4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if crc32fast::hash(body) != expected {
        return Err(IoError::new(ErrorKind::InvalidData, "segment checksum mismatch"));
    }
    bincode::deserialize(body).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
}

impl AppendLog for ObjectStoreAppendLog {
    fn append<'a>(&'a self, records: &'a [AppendRecord]) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let durable = self.durable_tail().await?;
            let mut staged = self.staged.lock();
            let mut taken = 0;
            for record in records {
                let tail = staged.last().map(|r| r.position).or(durable);
                if tail.map_or(true, |tail| record.position > tail) {
                    staged.push(record.clone());
                    taken += 1;
                }
            }
            Ok(taken)
        })
    }

    fn commit(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move {
            let pending = {
                let staged = self.staged.lock();
                match (staged.first(), staged.last()) {
                    (Some(first), Some(last)) => Some((
                        self.segment_key(first.position, last.position),
                        encode_segment(&staged)?,
                        last.position,
                    )),
                    _ => None,
                }
            };
            let Some((key, bytes, last)) = pending else {
                return self.durable_tail().await;
            };
            self.store.put(&key, &bytes).await?;
            // Only records up to `last` were written; anything staged since stays.
            self.staged.lock().retain(|record| record.position > last);
            *self.tail.lock() = Some(Some(last));
            Ok(Some(last))
        })
    }

    fn last_durable(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move {
            *self.tail.lock() = None;
            self.durable_tail().await
        })
    }
}

pub struct AppendLogSink<L: AppendLog> {
    id: SinkId,
    log: L,
    accepted: Option<Position>,
    durable: Option<Position>,
}

impl<L: AppendLog> AppendLogSink<L> {
    pub fn new(id: impl Into<SinkId>, log: L) -> Self {
        AppendLogSink {
            id: id.into(),
            log,
            accepted: None,
            durable: None,
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

impl<L: AppendLog> SinkWriter for AppendLogSink<L> {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::AppendLog
    }

    fn recover(&mut self) -> SinkFuture<'_, Option<Position>> {
        Box::pin(async move {
            let tail = self.log.last_durable().await?;
            self.durable = tail;
            self.accepted = tail;
            Ok(tail)
        })
    }

    fn apply<'a>(&'a mut self, batch: &'a [Arc<ChangeEvent>]) -> SinkFuture<'a, Option<Position>> {
        Box::pin(async move {
            let records: Vec<AppendRecord> = after_watermark(batch, self.accepted)
                .map(|event| AppendRecord::from(event.as_ref()))
                .collect();
            let Some(last) = records.last().map(|r| r.position) else {
                return Ok(self.accepted);
            };
            let taken = self.log.append(&records).await?;
            debug!(sink = %self.id, records = records.len(), taken, "Append batch");
            self.accepted = Some(last);
            Ok(self.accepted)
        })
    }

    fn flush(&mut self) -> SinkFuture<'_, Option<Position>> {
        Box::pin(async move {
            if self.accepted > self.durable {
                let tail = self.log.commit().await?;
                self.durable = tail.max(self.durable);
            }
            Ok(self.durable)
        })
    }

    fn durable_position(&self) -> Option<Position> {
        self.durable
    }
}
