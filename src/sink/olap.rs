//! OLAP bulk-load sink.
//!
//! Rows are buffered and loaded in batches. Every load carries a label
//! derived from the sink id and the batch's first and last position; the
//! destination refuses a label it has already loaded, so a retried load
//! after an ambiguous failure cannot double-count.

use super::{after_watermark, SinkFuture, SinkKind, SinkWriter};
use crate::clock::{SharedClock, Timestamp};
use crate::event::{ChangeEvent, Operation, Position, Row, TableId};
use crate::router::SinkId;
use crate::store::{PutCondition, SharedStore, StoreFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Row as loaded into the analytical store. Deletes load the before image
/// with `deleted` set, leaving merge semantics to the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlapRow {
    pub position: Position,
    pub table: TableId,
    pub operation: Operation,
    pub deleted: bool,
    pub columns: Row,
    pub commit_timestamp: u64,
}

impl From<&ChangeEvent> for OlapRow {
    fn from(event: &ChangeEvent) -> Self {
        let deleted = event.operation == Operation::Delete;
        let columns = if deleted {
            event.before_image.clone()
        } else {
            event.after_image.clone()
        };
        OlapRow {
            position: event.source_position,
            table: event.table_id.clone(),
            operation: event.operation,
            deleted,
            columns: columns.unwrap_or_default(),
            commit_timestamp: event.commit_timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Loaded,
    /// The label was loaded before; nothing changed.
    AlreadyLoaded,
}

/// Label for a batch spanning `first..=last`. Zero padding keeps labels
/// sortable by position.
pub fn batch_label(sink: &SinkId, first: Position, last: Position) -> String {
    format!("{}-{:020}-{:020}", sink, first.0, last.0)
}

fn label_last(label: &str) -> Option<Position> {
    label.rsplit('-').next()?.parse().ok().map(Position)
}

/// Bulk-ingest destination. A successful `ingest` is durable.
pub trait BulkIngest: Send + Sync + 'static {
    fn ingest<'a>(&'a self, label: &'a str, rows: &'a [OlapRow]) -> StoreFuture<'a, IngestOutcome>;

    /// Highest position covered by a loaded batch.
    fn loaded_through(&self) -> StoreFuture<'_, Option<Position>>;
}

impl<T: BulkIngest + ?Sized> BulkIngest for Arc<T> {
    fn ingest<'a>(&'a self, label: &'a str, rows: &'a [OlapRow]) -> StoreFuture<'a, IngestOutcome> {
        (**self).ingest(label, rows)
    }

    fn loaded_through(&self) -> StoreFuture<'_, Option<Position>> {
        (**self).loaded_through()
    }
}

#[derive(Debug, Default)]
struct IngestState {
    labels: BTreeSet<String>,
    rows: Vec<OlapRow>,
    loaded_through: Option<Position>,
}

/// In-memory bulk destination.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBulkIngest {
    inner: Arc<Mutex<IngestState>>,
}

impl InMemoryBulkIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<OlapRow> {
        self.inner.lock().rows.clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.inner.lock().labels.iter().cloned().collect()
    }
}

impl BulkIngest for InMemoryBulkIngest {
    fn ingest<'a>(&'a self, label: &'a str, rows: &'a [OlapRow]) -> StoreFuture<'a, IngestOutcome> {
        Box::pin(async move {
            let mut state = self.inner.lock();
            if !state.labels.insert(label.to_string()) {
                return Ok(IngestOutcome::AlreadyLoaded);
            }
            state.rows.extend_from_slice(rows);
            let last = rows.last().map(|row| row.position);
            state.loaded_through = state.loaded_through.max(last);
            Ok(IngestOutcome::Loaded)
        })
    }

    fn loaded_through(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move { Ok(self.inner.lock().loaded_through) })
    }
}

/// Bulk destination writing one JSON-lines object per label. The
/// create-if-absent write is the label check.
pub struct ObjectStoreBulkIngest {
    store: SharedStore,
    prefix: String,
}

impl ObjectStoreBulkIngest {
    pub fn new(store: SharedStore, prefix: &str) -> Self {
        ObjectStoreBulkIngest {
            store,
            prefix: prefix.to_string(),
        }
    }

    fn batch_key(&self, label: &str) -> String {
        format!("{}/{}.jsonl", self.prefix, label)
    }

    pub async fn read_all(&self) -> std::io::Result<Vec<OlapRow>> {
        let mut rows = Vec::new();
        for key in self.batch_keys().await? {
            let bytes = self.store.get(&key).await?;
            for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                rows.push(
                    serde_json::from_slice(line)
                        .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?,
                );
            }
        }
        Ok(rows)
    }

    async fn batch_keys(&self) -> std::io::Result<Vec<String>> {
        let prefix = format!("{}/", self.prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.store.list(&prefix, token.as_deref()).await?;
            keys.extend(
                page.objects
                    .into_iter()
                    .map(|meta| meta.key)
                    .filter(|key| key.ends_with(".jsonl")),
            );
            match page.continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl BulkIngest for ObjectStoreBulkIngest {
    fn ingest<'a>(&'a self, label: &'a str, rows: &'a [OlapRow]) -> StoreFuture<'a, IngestOutcome> {
        Box::pin(async move {
            let mut body = Vec::new();
            for row in rows {
                serde_json::to_writer(&mut body, row)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
                body.push(b'\n');
            }
            let key = self.batch_key(label);
            match self.store.put_if(&key, &body, &PutCondition::Absent).await? {
                Some(_) => Ok(IngestOutcome::Loaded),
                None => Ok(IngestOutcome::AlreadyLoaded),
            }
        })
    }

    fn loaded_through(&self) -> StoreFuture<'_, Option<Position>> {
        Box::pin(async move {
            Ok(self
                .batch_keys()
                .await?
                .iter()
                .filter_map(|key| {
                    let label = key.rsplit('/').next()?.strip_suffix(".jsonl")?;
                    label_last(label)
                })
                .max())
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OlapBatchLimits {
    pub max_batch_rows: usize,
    pub max_batch_age: Duration,
}

impl Default for OlapBatchLimits {
    fn default() -> Self {
        OlapBatchLimits {
            max_batch_rows: 10_000,
            max_batch_age: Duration::from_secs(30),
        }
    }
}

pub struct OlapNativeSink<B: BulkIngest> {
    id: SinkId,
    target: B,
    limits: OlapBatchLimits,
    clock: SharedClock,
    buffer: Vec<OlapRow>,
    buffer_started: Option<Timestamp>,
    accepted: Option<Position>,
    durable: Option<Position>,
    batches_loaded: u64,
}

impl<B: BulkIngest> OlapNativeSink<B> {
    pub fn new(id: impl Into<SinkId>, target: B, limits: OlapBatchLimits, clock: SharedClock) -> Self {
        OlapNativeSink {
            id: id.into(),
            target,
            limits,
            clock,
            buffer: Vec::new(),
            buffer_started: None,
            accepted: None,
            durable: None,
            batches_loaded: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn batches_loaded(&self) -> u64 {
        self.batches_loaded
    }

    fn batch_due(&self) -> bool {
        if self.buffer.len() >= self.limits.max_batch_rows {
            return true;
        }
        self.buffer_started
            .map(|started| self.clock.now().saturating_sub(started) >= self.limits.max_batch_age)
            .unwrap_or(false)
    }

    /// Load the buffer as one labelled batch. The buffer is kept on error so
    /// a retry loads the same label.
    async fn load_buffer(&mut self) -> Result<(), super::SinkError> {
        let (Some(first), Some(last)) = (self.buffer.first(), self.buffer.last()) else {
            return Ok(());
        };
        let (first, last) = (first.position, last.position);
        let label = batch_label(&self.id, first, last);
        let outcome = self.target.ingest(&label, &self.buffer).await?;
        match outcome {
            IngestOutcome::Loaded => {
                debug!(sink = %self.id, label = %label, rows = self.buffer.len(), "Batch loaded")
            }
            IngestOutcome::AlreadyLoaded => {
                info!(sink = %self.id, label = %label, "Batch label already loaded")
            }
        }
        self.batches_loaded += 1;
        self.buffer.clear();
        self.buffer_started = None;
        self.durable = self.durable.max(Some(last));
        Ok(())
    }
}

impl<B: BulkIngest> SinkWriter for OlapNativeSink<B> {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::OlapNative
    }

    fn recover(&mut self) -> SinkFuture<'_, Option<Position>> {
        Box::pin(async move {
            let loaded = self.target.loaded_through().await?;
            self.durable = loaded;
            self.accepted = loaded;
            Ok(loaded)
        })
    }

    fn apply<'a>(&'a mut self, batch: &'a [Arc<ChangeEvent>]) -> SinkFuture<'a, Option<Position>> {
        Box::pin(async move {
            for event in after_watermark(batch, self.accepted) {
                if self.buffer.is_empty() {
                    self.buffer_started = Some(self.clock.now());
                }
                self.buffer.push(OlapRow::from(event.as_ref()));
                self.accepted = Some(event.source_position);
            }
            if self.batch_due() {
                self.load_buffer().await?;
            }
            Ok(self.accepted)
        })
    }

    fn flush(&mut self) -> SinkFuture<'_, Option<Position>> {
        Box::pin(async move {
            self.load_buffer().await?;
            Ok(self.durable)
        })
    }

    fn durable_position(&self) -> Option<Position> {
        self.durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::event::Value;
    use crate::store::InMemoryObjectStore;

    fn event(pos: u64) -> Arc<ChangeEvent> {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(pos as i64));
        Arc::new(ChangeEvent {
            source_position: Position(pos),
            table_id: TableId::new("shop", "orders"),
            operation: Operation::Insert,
            before_image: None,
            after_image: Some(row),
            commit_timestamp: 0,
            primary_key: vec!["id".into()],
        })
    }

    fn limits(rows: usize, age_ms: u64) -> OlapBatchLimits {
        OlapBatchLimits {
            max_batch_rows: rows,
            max_batch_age: Duration::from_millis(age_ms),
        }
    }

    #[tokio::test]
    async fn test_loads_when_row_limit_reached() {
        let target = InMemoryBulkIngest::new();
        let clock = Arc::new(SimulatedClock::new(0));
        let mut sink = OlapNativeSink::new("olap", target.clone(), limits(3, 60_000), clock);

        let events: Vec<_> = (1..=4).map(event).collect();
        sink.apply(&events[..2]).await.unwrap();
        assert_eq!(sink.buffered(), 2);
        assert!(target.rows().is_empty());

        sink.apply(&events[2..]).await.unwrap();
        assert_eq!(target.rows().len(), 4);
        assert_eq!(sink.durable_position(), Some(Position(4)));
    }

    #[tokio::test]
    async fn test_loads_when_batch_ages() {
        let target = InMemoryBulkIngest::new();
        let clock = Arc::new(SimulatedClock::new(0));
        let mut sink = OlapNativeSink::new("olap", target.clone(), limits(100, 1_000), clock.clone());

        sink.apply(&[event(1)]).await.unwrap();
        clock.advance_ms(1_500);
        sink.apply(&[event(2)]).await.unwrap();
        assert_eq!(target.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_retried_label_is_not_double_loaded() {
        let target = InMemoryBulkIngest::new();
        let clock = Arc::new(SimulatedClock::new(0));
        let events: Vec<_> = (5..=7).map(event).collect();

        let mut first = OlapNativeSink::new("olap", target.clone(), limits(100, 60_000), clock.clone());
        first.apply(&events).await.unwrap();
        first.flush().await.unwrap();

        // Same batch loaded again by a writer that lost its acknowledgement.
        let mut second = OlapNativeSink::new("olap", target.clone(), limits(100, 60_000), clock);
        second.apply(&events).await.unwrap();
        second.flush().await.unwrap();

        assert_eq!(target.rows().len(), 3);
        assert_eq!(target.labels(), vec![batch_label(&"olap".into(), Position(5), Position(7))]);
    }

    #[tokio::test]
    async fn test_object_store_ingest_recovers_watermark() {
        let store: SharedStore = Arc::new(InMemoryObjectStore::new());
        let clock = Arc::new(SimulatedClock::new(0));
        let mut sink = OlapNativeSink::new(
            "olap",
            ObjectStoreBulkIngest::new(store.clone(), "olap"),
            limits(2, 60_000),
            clock.clone(),
        );
        sink.apply(&(1..=3).map(event).collect::<Vec<_>>()).await.unwrap();
        sink.flush().await.unwrap();

        let mut reopened = OlapNativeSink::new(
            "olap",
            ObjectStoreBulkIngest::new(store.clone(), "olap"),
            limits(2, 60_000),
            clock,
        );
        assert_eq!(reopened.recover().await.unwrap(), Some(Position(3)));
        let rows = ObjectStoreBulkIngest::new(store, "olap").read_all().await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
