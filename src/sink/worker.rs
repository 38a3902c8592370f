//! Sink worker actor.
//!
//! Each sink runs in its own task fed by a bounded queue. The worker
//! batches queued events, applies them with retry, and answers checkpoint
//! barriers after flushing. Barriers travel through the same queue as
//! events, so a barrier at position P is handled only after every event at
//! or below P routed to this sink.
//!
//! Exhausted retries or a permanent error mark the sink degraded. A
//! degraded sink stays degraded until the pipeline restarts: it discards
//! further deliveries and answers barriers with `Degraded`, which holds
//! the global checkpoint back so the discarded events are replayed later.

use super::{BoxedSink, SinkError, SinkKind};
use crate::event::{ChangeEvent, Position};
use crate::io::ProductionRng;
use crate::retry::RetryPolicy;
use crate::router::SinkId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) enum SinkCommand {
    Deliver(Arc<ChangeEvent>),
    Barrier {
        checkpoint_id: u64,
        position: Position,
        reply: oneshot::Sender<BarrierAck>,
    },
    /// The pipeline confirmed a checkpoint; housekeeping may run.
    Checkpointed(Position),
    Shutdown {
        reply: oneshot::Sender<SinkReport>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Everything routed at or below the barrier is durable.
    Durable(Position),
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierAck {
    pub sink: SinkId,
    pub checkpoint_id: u64,
    pub outcome: BarrierOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkHealth {
    Starting,
    Healthy,
    Retrying,
    Degraded,
}

impl SinkHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SinkHealth::Starting,
            1 => SinkHealth::Healthy,
            2 => SinkHealth::Retrying,
            _ => SinkHealth::Degraded,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SinkHealth::Starting => 0,
            SinkHealth::Healthy => 1,
            SinkHealth::Retrying => 2,
            SinkHealth::Degraded => 3,
        }
    }
}

/// Point-in-time view of one sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkStatus {
    pub id: SinkId,
    pub kind: SinkKind,
    pub health: SinkHealth,
    pub applied_through: Option<Position>,
    pub durable_through: Option<Position>,
    /// Highest barrier acknowledged as durable.
    pub acked_through: Option<Position>,
    pub queued: usize,
    pub events_received: u64,
    pub events_applied: u64,
    pub events_skipped: u64,
    pub events_discarded: u64,
    pub retries: u64,
    pub last_error: Option<String>,
    pub degraded_reason: Option<String>,
}

/// Final state reported on shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    pub sink: SinkId,
    pub durable_through: Option<Position>,
    pub acked_through: Option<Position>,
    pub events_discarded: u64,
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Default)]
struct Progress {
    applied_through: Option<Position>,
    durable_through: Option<Position>,
    acked_through: Option<Position>,
    last_error: Option<String>,
    degraded_reason: Option<String>,
}

struct SinkShared {
    id: SinkId,
    kind: SinkKind,
    health: AtomicU8,
    received: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
    retries: AtomicU64,
    progress: Mutex<Progress>,
}

impl SinkShared {
    fn new(id: SinkId, kind: SinkKind) -> Self {
        SinkShared {
            id,
            kind,
            health: AtomicU8::new(SinkHealth::Starting.as_u8()),
            received: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            progress: Mutex::new(Progress::default()),
        }
    }

    fn health(&self) -> SinkHealth {
        SinkHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    fn set_health(&self, health: SinkHealth) {
        // Degraded is terminal for the life of the worker.
        let _ = self
            .health
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SinkHealth::Degraded.as_u8()).then_some(health.as_u8())
            });
    }

    fn is_degraded(&self) -> bool {
        self.health() == SinkHealth::Degraded
    }

    fn degraded_reason(&self) -> String {
        self.progress
            .lock()
            .degraded_reason
            .clone()
            .unwrap_or_else(|| "sink degraded".to_string())
    }

    fn discard(&self, count: usize) {
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub batch_max_events: usize,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn test() -> Self {
        WorkerConfig {
            queue_capacity: 16,
            batch_max_events: 8,
            retry: RetryPolicy::test(),
        }
    }
}

/// Cloneable sending half used by the read loop and the coordinator.
#[derive(Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<SinkCommand>,
    shared: Arc<SinkShared>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkClosed(pub SinkId);

impl std::fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink worker {} has stopped", self.0)
    }
}

impl std::error::Error for SinkClosed {}

impl SinkSender {
    pub fn id(&self) -> &SinkId {
        &self.shared.id
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.is_degraded()
    }

    /// Queue an event, waiting while the queue is full. A degraded sink
    /// drops the event without queueing it.
    pub async fn deliver(&self, event: Arc<ChangeEvent>) -> Result<(), SinkClosed> {
        if self.shared.is_degraded() {
            self.shared.received.fetch_add(1, Ordering::Relaxed);
            self.shared.discard(1);
            return Ok(());
        }
        self.tx
            .send(SinkCommand::Deliver(event))
            .await
            .map_err(|_| SinkClosed(self.shared.id.clone()))
    }

    /// Queue a barrier behind everything already delivered and wait for
    /// the worker's answer.
    pub async fn barrier(&self, checkpoint_id: u64, position: Position) -> BarrierAck {
        let stopped = || BarrierAck {
            sink: self.shared.id.clone(),
            checkpoint_id,
            outcome: BarrierOutcome::Degraded("sink worker stopped".to_string()),
        };
        let (reply, rx) = oneshot::channel();
        let command = SinkCommand::Barrier {
            checkpoint_id,
            position,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return stopped();
        }
        rx.await.unwrap_or_else(|_| stopped())
    }

    /// Best effort; skipped when the queue is full. Returns whether the
    /// notice was queued. A skipped notice only delays housekeeping until
    /// the next confirmed checkpoint.
    pub fn checkpointed(&self, confirmed: Position) -> bool {
        match self.tx.try_send(SinkCommand::Checkpointed(confirmed)) {
            Ok(()) => true,
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "worker stopped",
                };
                debug!(sink = %self.shared.id, confirmed = %confirmed, reason, "Checkpoint notice dropped");
                false
            }
        }
    }
}

/// Owning handle to a running worker.
pub struct SinkHandle {
    sender: SinkSender,
    capacity: usize,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SinkHandle {
    pub fn id(&self) -> &SinkId {
        self.sender.id()
    }

    pub fn kind(&self) -> SinkKind {
        self.sender.shared.kind
    }

    pub fn sender(&self) -> SinkSender {
        self.sender.clone()
    }

    pub fn health(&self) -> SinkHealth {
        self.sender.shared.health()
    }

    pub fn is_degraded(&self) -> bool {
        self.sender.is_degraded()
    }

    pub fn status(&self) -> SinkStatus {
        let shared = &self.sender.shared;
        let progress = shared.progress.lock();
        SinkStatus {
            id: shared.id.clone(),
            kind: shared.kind,
            health: shared.health(),
            applied_through: progress.applied_through,
            durable_through: progress.durable_through,
            acked_through: progress.acked_through,
            queued: self.capacity.saturating_sub(self.sender.tx.capacity()),
            events_received: shared.received.load(Ordering::Relaxed),
            events_applied: shared.applied.load(Ordering::Relaxed),
            events_skipped: shared.skipped.load(Ordering::Relaxed),
            events_discarded: shared.discarded.load(Ordering::Relaxed),
            retries: shared.retries.load(Ordering::Relaxed),
            last_error: progress.last_error.clone(),
            degraded_reason: progress.degraded_reason.clone(),
        }
    }

    /// Drain the queue, flush and stop. Gives up and cancels the worker
    /// after `timeout`.
    pub async fn shutdown(&mut self, timeout: Duration) -> Option<SinkReport> {
        let (reply, rx) = oneshot::channel();
        let report = match tokio::time::timeout(timeout, async {
            self.sender.tx.send(SinkCommand::Shutdown { reply }).await.ok()?;
            rx.await.ok()
        })
        .await
        {
            Ok(report) => report,
            Err(_) => {
                warn!(sink = %self.id(), "Sink shutdown timed out");
                None
            }
        };
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
        report
    }

    /// Stop immediately without flushing, as a crash would.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

enum Halt {
    Degraded,
    Cancelled,
}

pub struct SinkWorker {
    writer: BoxedSink,
    rx: mpsc::Receiver<SinkCommand>,
    shared: Arc<SinkShared>,
    config: WorkerConfig,
    cancel: CancellationToken,
    skip_through: Option<Position>,
    deferred: Option<SinkCommand>,
    rng: ProductionRng,
}

impl SinkWorker {
    /// Start a worker. Events at or below `resume_after` are skipped; the
    /// writer's own recovered watermark raises that floor further.
    pub fn spawn(
        writer: BoxedSink,
        resume_after: Option<Position>,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> SinkHandle {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(SinkShared::new(writer.id().clone(), writer.kind()));
        let worker = SinkWorker {
            writer,
            rx,
            shared: shared.clone(),
            config,
            cancel: cancel.clone(),
            skip_through: resume_after,
            deferred: None,
            rng: ProductionRng::new(),
        };
        let join = tokio::spawn(worker.run());
        SinkHandle {
            sender: SinkSender { tx, shared },
            capacity,
            cancel,
            join: Some(join),
        }
    }

    async fn run(mut self) {
        let sink = self.shared.id.clone();
        match self.recover().await {
            Ok(()) => self.shared.set_health(SinkHealth::Healthy),
            Err(Halt::Cancelled) => return,
            Err(Halt::Degraded) => {}
        }

        loop {
            let command = match self.deferred.take() {
                Some(command) => command,
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    command = self.rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                },
            };

            match command {
                SinkCommand::Deliver(event) => {
                    if let Err(Halt::Cancelled) = self.handle_deliver(event).await {
                        break;
                    }
                }
                SinkCommand::Barrier {
                    checkpoint_id,
                    position,
                    reply,
                } => {
                    let outcome = match self.handle_barrier(position).await {
                        Ok(outcome) => outcome,
                        Err(Halt::Cancelled) => break,
                        Err(Halt::Degraded) => BarrierOutcome::Degraded(self.shared.degraded_reason()),
                    };
                    debug!(sink = %sink, checkpoint_id, position = %position, outcome = ?outcome, "Barrier handled");
                    let _ = reply.send(BarrierAck {
                        sink: sink.clone(),
                        checkpoint_id,
                        outcome,
                    });
                }
                SinkCommand::Checkpointed(confirmed) => {
                    if !self.shared.is_degraded() {
                        if let Err(e) = self.writer.on_checkpoint(confirmed).await {
                            warn!(sink = %sink, error = %e, "Checkpoint housekeeping failed");
                        }
                    }
                }
                SinkCommand::Shutdown { reply } => {
                    if !self.shared.is_degraded() {
                        if let Err(Halt::Cancelled) = self.flush().await {
                            break;
                        }
                    }
                    let _ = reply.send(self.report());
                    break;
                }
            }
        }
        debug!(sink = %sink, "Sink worker stopped");
    }

    fn report(&self) -> SinkReport {
        let progress = self.shared.progress.lock();
        SinkReport {
            sink: self.shared.id.clone(),
            durable_through: progress.durable_through,
            acked_through: progress.acked_through,
            events_discarded: self.shared.discarded.load(Ordering::Relaxed),
            degraded_reason: progress.degraded_reason.clone(),
        }
    }

    async fn recover(&mut self) -> Result<(), Halt> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                result = self.writer.recover() => result,
            };
            match result {
                Ok(watermark) => {
                    self.skip_through = self.skip_through.max(watermark);
                    self.shared.progress.lock().durable_through = watermark;
                    info!(
                        sink = %self.shared.id,
                        kind = %self.shared.kind,
                        watermark = ?watermark,
                        skip_through = ?self.skip_through,
                        "Sink recovered"
                    );
                    return Ok(());
                }
                Err(e) => self.on_failure("recover", &mut attempt, e).await?,
            }
        }
    }

    fn admit(&self, event: Arc<ChangeEvent>, batch: &mut Vec<Arc<ChangeEvent>>) {
        self.shared.received.fetch_add(1, Ordering::Relaxed);
        if self.skip_through.is_some_and(|skip| event.source_position <= skip) {
            self.shared.skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            batch.push(event);
        }
    }

    async fn handle_deliver(&mut self, event: Arc<ChangeEvent>) -> Result<(), Halt> {
        if self.shared.is_degraded() {
            self.shared.received.fetch_add(1, Ordering::Relaxed);
            self.shared.discard(1);
            return Ok(());
        }
        let mut batch = Vec::with_capacity(self.config.batch_max_events);
        self.admit(event, &mut batch);
        while batch.len() < self.config.batch_max_events {
            match self.rx.try_recv() {
                Ok(SinkCommand::Deliver(event)) => self.admit(event, &mut batch),
                Ok(other) => {
                    self.deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.apply_batch(batch).await
    }

    async fn apply_batch(&mut self, batch: Vec<Arc<ChangeEvent>>) -> Result<(), Halt> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                result = self.writer.apply(&batch) => result,
            };
            match result {
                Ok(accepted) => {
                    self.shared.applied.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    {
                        let mut progress = self.shared.progress.lock();
                        progress.applied_through = progress.applied_through.max(accepted);
                        progress.durable_through = self.writer.durable_position();
                    }
                    self.shared.set_health(SinkHealth::Healthy);
                    return Ok(());
                }
                Err(e) => {
                    if let Err(halt) = self.on_failure("apply", &mut attempt, e).await {
                        if let Halt::Degraded = halt {
                            self.shared.discard(batch.len());
                        }
                        return Err(halt);
                    }
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<Option<Position>, Halt> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                result = self.writer.flush() => result,
            };
            match result {
                Ok(durable) => {
                    self.shared.progress.lock().durable_through = durable;
                    self.shared.set_health(SinkHealth::Healthy);
                    return Ok(durable);
                }
                Err(e) => self.on_failure("flush", &mut attempt, e).await?,
            }
        }
    }

    async fn handle_barrier(&mut self, position: Position) -> Result<BarrierOutcome, Halt> {
        if self.shared.is_degraded() {
            return Err(Halt::Degraded);
        }
        self.flush().await?;
        let mut progress = self.shared.progress.lock();
        progress.acked_through = progress.acked_through.max(Some(position));
        Ok(BarrierOutcome::Durable(position))
    }

    /// Back off for a retryable error, or degrade the sink.
    async fn on_failure(&mut self, op: &str, attempt: &mut u32, err: SinkError) -> Result<(), Halt> {
        *attempt += 1;
        self.shared.progress.lock().last_error = Some(err.to_string());
        if err.is_transient() && self.config.retry.allows(*attempt) {
            self.shared.retries.fetch_add(1, Ordering::Relaxed);
            self.shared.set_health(SinkHealth::Retrying);
            let delay = self.config.retry.delay(*attempt, &mut self.rng);
            warn!(
                sink = %self.shared.id,
                op,
                attempt = *attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Sink operation failed, retrying"
            );
            return tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Halt::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            };
        }

        let reason = if err.is_transient() {
            format!("{} failed after {} attempts: {}", op, attempt, err)
        } else {
            format!("{} failed: {}", op, err)
        };
        error!(sink = %self.shared.id, reason = %reason, "Sink degraded");
        self.shared.progress.lock().degraded_reason = Some(reason);
        self.shared.set_health(SinkHealth::Degraded);
        Err(Halt::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, Row, TableId, Value};
    use crate::io::SimulatedRng;
    use crate::sink::{
        AppendLogSink, FaultyTarget, InMemoryAppendLog, InMemoryKeyedTable, TargetFaults,
        UpsertTableSink,
    };

    fn event(pos: u64) -> Arc<ChangeEvent> {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(pos as i64));
        Arc::new(ChangeEvent {
            source_position: Position(pos),
            table_id: TableId::new("s", "t"),
            operation: Operation::Insert,
            before_image: None,
            after_image: Some(row),
            commit_timestamp: 0,
            primary_key: vec!["id".into()],
        })
    }

    #[tokio::test]
    async fn test_barrier_acks_after_flush() {
        let log = InMemoryAppendLog::new();
        let mut handle = SinkWorker::spawn(
            Box::new(AppendLogSink::new("audit", log.clone())),
            None,
            WorkerConfig::test(),
            CancellationToken::new(),
        );
        let sender = handle.sender();
        for pos in 1..=5 {
            sender.deliver(event(pos)).await.unwrap();
        }
        let ack = sender.barrier(1, Position(5)).await;
        assert_eq!(ack.outcome, BarrierOutcome::Durable(Position(5)));
        assert_eq!(log.records().len(), 5);

        let status = handle.status();
        assert_eq!(status.health, SinkHealth::Healthy);
        assert_eq!(status.acked_through, Some(Position(5)));
        assert_eq!(status.durable_through, Some(Position(5)));

        let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.degraded_reason, None);
    }

    #[tokio::test]
    async fn test_checkpoint_notice_reports_when_dropped() {
        let mut handle = SinkWorker::spawn(
            Box::new(AppendLogSink::new("audit", InMemoryAppendLog::new())),
            None,
            WorkerConfig::test(),
            CancellationToken::new(),
        );
        let sender = handle.sender();
        sender.deliver(event(1)).await.unwrap();
        sender.barrier(1, Position(1)).await;
        assert!(sender.checkpointed(Position(1)));

        handle.shutdown(Duration::from_secs(1)).await;
        assert!(!sender.checkpointed(Position(1)));
    }

    #[tokio::test]
    async fn test_skips_events_at_or_below_resume_point() {
        let table = InMemoryKeyedTable::new();
        let mut handle = SinkWorker::spawn(
            Box::new(UpsertTableSink::new("t", table.clone())),
            Some(Position(3)),
            WorkerConfig::test(),
            CancellationToken::new(),
        );
        let sender = handle.sender();
        for pos in 1..=5 {
            sender.deliver(event(pos)).await.unwrap();
        }
        sender.barrier(1, Position(5)).await;
        assert_eq!(table.rows(&TableId::new("s", "t")).len(), 2);
        assert_eq!(handle.status().events_skipped, 3);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_and_discard() {
        let log = InMemoryAppendLog::new();
        let target = FaultyTarget::new(
            log.clone(),
            SimulatedRng::new(3),
            TargetFaults::failing_after(Position(2)),
        );
        let mut handle = SinkWorker::spawn(
            Box::new(AppendLogSink::new("b", target)),
            None,
            WorkerConfig {
                batch_max_events: 1,
                ..WorkerConfig::test()
            },
            CancellationToken::new(),
        );
        let sender = handle.sender();
        for pos in 1..=2 {
            sender.deliver(event(pos)).await.unwrap();
        }
        let ack = sender.barrier(1, Position(2)).await;
        assert_eq!(ack.outcome, BarrierOutcome::Durable(Position(2)));

        for pos in 3..=6 {
            sender.deliver(event(pos)).await.unwrap();
        }
        let ack = sender.barrier(2, Position(6)).await;
        assert!(matches!(ack.outcome, BarrierOutcome::Degraded(_)));
        assert!(handle.is_degraded());

        // Still degraded, even for later barriers.
        sender.deliver(event(7)).await.unwrap();
        let ack = sender.barrier(3, Position(7)).await;
        assert!(matches!(ack.outcome, BarrierOutcome::Degraded(_)));

        let status = handle.status();
        assert_eq!(status.acked_through, Some(Position(2)));
        assert_eq!(status.events_discarded, 5);
        assert!(status.degraded_reason.unwrap().contains("attempts"));
        assert_eq!(log.records().len(), 2);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_permanent_error_degrades_without_retry() {
        let mut handle = SinkWorker::spawn(
            Box::new(UpsertTableSink::new("t", InMemoryKeyedTable::new())),
            None,
            WorkerConfig::test(),
            CancellationToken::new(),
        );
        let sender = handle.sender();
        let mut keyless = (*event(1)).clone();
        keyless.primary_key.clear();
        sender.deliver(Arc::new(keyless)).await.unwrap();
        let ack = sender.barrier(1, Position(1)).await;
        assert!(matches!(ack.outcome, BarrierOutcome::Degraded(_)));
        assert_eq!(handle.status().retries, 0);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_abort_leaves_unflushed_work() {
        let log = InMemoryAppendLog::new();
        let mut handle = SinkWorker::spawn(
            Box::new(AppendLogSink::new("audit", log.clone())),
            None,
            WorkerConfig::test(),
            CancellationToken::new(),
        );
        handle.sender().deliver(event(1)).await.unwrap();
        handle.abort();
        log.crash();
        assert!(log.records().is_empty());
    }
}
