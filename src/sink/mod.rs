//! Sink writers: idempotent application of change events to destinations.
//!
//! Every writer follows the same contract. `apply` accepts events in source
//! position order and may buffer them. `flush` blocks until everything
//! accepted so far is durable in the destination and returns the durable
//! watermark. Re-applying an event at or below the watermark must leave
//! the destination unchanged, which is what makes replay after a crash
//! safe.
//!
//! Three destination shapes are supported:
//!
//! - [`upsert::UpsertTableSink`]: keyed rows, last-writer-wins on position
//! - [`append::AppendLogSink`]: ordered change history, de-duplicated by position
//! - [`olap::OlapNativeSink`]: bulk loads with label de-duplication
//!
//! Writers run inside a [`worker::SinkWorker`] that owns retries and health.

pub mod append;
pub mod olap;
pub mod simulated;
pub mod upsert;
pub mod worker;

pub use append::{AppendLog, AppendLogSink, AppendRecord, InMemoryAppendLog, ObjectStoreAppendLog};
pub use olap::{
    batch_label, BulkIngest, InMemoryBulkIngest, IngestOutcome, ObjectStoreBulkIngest,
    OlapBatchLimits, OlapNativeSink, OlapRow,
};
pub use simulated::{FaultyTarget, TargetFaults};
pub use upsert::{
    InMemoryKeyedTable, KeyedTable, KeyedWrite, ObjectStoreKeyedTable, SchemaPolicy,
    UpsertTableSink,
};
pub use worker::{
    BarrierAck, BarrierOutcome, SinkClosed, SinkHandle, SinkHealth, SinkReport, SinkSender,
    SinkStatus, SinkWorker, WorkerConfig,
};

use crate::event::{ChangeEvent, Position, TableId};
use crate::router::SinkId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    UpsertTable,
    AppendLog,
    OlapNative,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkKind::UpsertTable => "upsert_table",
            SinkKind::AppendLog => "append_log",
            SinkKind::OlapNative => "olap_native",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum SinkError {
    /// Destination unavailable or timed out. Retryable.
    Transient(String),
    Io(std::io::Error),
    /// Event lacks the key columns an upsert destination needs.
    MissingPrimaryKey { table: TableId, position: Position },
    /// Row shape not accepted under the configured schema policy.
    Schema { table: TableId, reason: String },
    /// Destination refused the write permanently.
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Transient(_) => true,
            SinkError::Io(e) => crate::store::is_transient(e),
            _ => false,
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Transient(msg) => write!(f, "transient sink failure: {}", msg),
            SinkError::Io(e) => write!(f, "sink I/O error: {}", e),
            SinkError::MissingPrimaryKey { table, position } => write!(
                f,
                "event at {} for {} has no usable primary key",
                position, table
            ),
            SinkError::Schema { table, reason } => {
                write!(f, "schema mismatch for {}: {}", table, reason)
            }
            SinkError::Rejected(msg) => write!(f, "sink rejected write: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

pub trait SinkWriter: Send + 'static {
    fn id(&self) -> &SinkId;

    fn kind(&self) -> SinkKind;

    /// Read the destination's durable watermark. Called once before the
    /// first `apply`.
    fn recover(&mut self) -> SinkFuture<'_, Option<Position>>;

    /// Accept a batch in position order. Returns the highest position
    /// accepted, which is not necessarily durable yet.
    fn apply<'a>(&'a mut self, batch: &'a [Arc<ChangeEvent>]) -> SinkFuture<'a, Option<Position>>;

    /// Make everything accepted durable. Returns the durable watermark.
    fn flush(&mut self) -> SinkFuture<'_, Option<Position>>;

    /// Last durable watermark known to this writer, without I/O.
    fn durable_position(&self) -> Option<Position>;

    /// Housekeeping once `confirmed` is checkpointed for the whole pipeline.
    fn on_checkpoint(&mut self, _confirmed: Position) -> SinkFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

pub type BoxedSink = Box<dyn SinkWriter>;

/// Events above `watermark`, in order.
pub(crate) fn after_watermark(
    batch: &[Arc<ChangeEvent>],
    watermark: Option<Position>,
) -> impl Iterator<Item = &Arc<ChangeEvent>> {
    batch
        .iter()
        .filter(move |e| watermark.map_or(true, |w| e.source_position > w))
}
