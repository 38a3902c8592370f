//! Pipeline control loop and read loop.
//!
//! `start` runs the STARTING phase inline: lease, stored state, binding
//! check, resume point. Once the source accepts the resume point the read
//! loop and one worker per sink are spawned and the control loop takes over.
//!
//! The read loop owns reading, decoding and routing. It publishes the
//! highest position whose events are all queued to their sinks; only that
//! position is ever offered to the checkpointer, so an event that was read
//! but not yet queued cannot be covered by a checkpoint.

use super::config::PipelineConfig;
use super::status::{self, PipelinePhase, PipelineStatus, SinkLag};
use super::PipelineError;
use crate::checkpoint::{BarrierRequest, CheckpointAction, Checkpointer, PersistRequest};
use crate::clock::{SharedClock, Timestamp};
use crate::decode::EventDecoder;
use crate::event::{Position, StartPosition};
use crate::position::{Lease, PipelineState, PositionStore};
use crate::router::{Router, SinkBindings, SinkId};
use crate::sink::{
    BarrierAck, BoxedSink, SinkHandle, SinkHealth, SinkReport, SinkSender, SinkWorker,
    WorkerConfig,
};
use crate::source::{LogReader, SharedSource, SourceError};
use crate::store::SharedStore;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a graceful stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub last_confirmed_position: Option<Position>,
    pub highest_dispatched: Option<Position>,
    pub sinks: Vec<SinkReport>,
    /// Every dispatched event was confirmed and every sink flushed.
    /// Otherwise events past `last_confirmed_position` replay on restart.
    pub clean: bool,
}

enum Command {
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<Result<StopReport, PipelineError>>,
    },
}

/// Counters shared between the read loop and the control loop.
#[derive(Debug, Default)]
struct ReadProgress {
    /// Highest fully dispatched position plus one; zero means none yet.
    dispatched_through: AtomicU64,
    dispatched: AtomicU64,
    records: AtomicU64,
    decoded: AtomicU64,
    skipped: AtomicU64,
    unrouted: AtomicU64,
    reconnects: AtomicU64,
}

impl ReadProgress {
    fn highest(&self) -> Option<Position> {
        match self.dispatched_through.load(Ordering::Acquire) {
            0 => None,
            n => Some(Position(n - 1)),
        }
    }

    fn dispatched(&self, position: Position) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.dispatched_through
            .fetch_max(position.0.saturating_add(1), Ordering::AcqRel);
    }
}

enum ReadExit {
    Cancelled,
    Failed(PipelineError),
}

struct ReadLoop {
    reader: LogReader,
    decoder: EventDecoder,
    router: Router,
    senders: BTreeMap<SinkId, SinkSender>,
    progress: Arc<ReadProgress>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl ReadLoop {
    async fn run(mut self) -> ReadExit {
        let result = self.read_all().await;
        self.reader.close();
        match result {
            Ok(()) | Err(PipelineError::Source(SourceError::Cancelled)) => ReadExit::Cancelled,
            Err(e) => ReadExit::Failed(e),
        }
    }

    async fn read_all(&mut self) -> Result<(), PipelineError> {
        loop {
            self.wait_while_paused().await?;
            let record = self.reader.next().await?;
            self.progress.records.fetch_add(1, Ordering::Relaxed);
            self.progress
                .reconnects
                .store(self.reader.stats().reconnects, Ordering::Relaxed);

            let Some(event) = self.decoder.decode_with_policy(&record)? else {
                self.progress.skipped.fetch_add(1, Ordering::Relaxed);
                self.progress.dispatched(record.position);
                continue;
            };
            self.progress.decoded.fetch_add(1, Ordering::Relaxed);

            // A record pulled before a pause is delivered after resume.
            self.wait_while_paused().await?;

            let deliveries = self.router.route(Arc::new(event));
            if deliveries.is_empty() {
                self.progress.unrouted.fetch_add(1, Ordering::Relaxed);
            }
            for (sink, event) in deliveries {
                let Some(sender) = self.senders.get(&sink) else {
                    continue;
                };
                let delivered = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(SourceError::Cancelled.into()),
                    r = sender.deliver(event) => r,
                };
                if delivered.is_err() {
                    return Err(SourceError::Cancelled.into());
                }
            }
            self.progress.dispatched(record.position);
        }
    }

    async fn wait_while_paused(&mut self) -> Result<(), PipelineError> {
        if !*self.paused.borrow() {
            return Ok(());
        }
        debug!(last_position = ?self.reader.last_position(), "Read loop paused");
        let resumed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            r = self.paused.wait_for(|paused| !*paused) => r.is_ok(),
        };
        if resumed {
            Ok(())
        } else {
            Err(SourceError::Cancelled.into())
        }
    }
}

/// Everything `start` needs. Assembled by [`super::PipelineBuilder`].
pub(crate) struct PipelineParts {
    pub config: PipelineConfig,
    pub source: SharedSource,
    pub state_store: SharedStore,
    pub clock: SharedClock,
    pub writers: Vec<BoxedSink>,
}

pub(crate) async fn start(parts: PipelineParts) -> Result<PipelineHandle, PipelineError> {
    let PipelineParts {
        config,
        source,
        state_store,
        clock,
        writers,
    } = parts;
    config.validate()?;

    let pipeline_id = config.pipeline_id.clone();
    let bindings = config.sink_bindings();
    let store = PositionStore::new(
        state_store,
        config.lease.prefix.clone(),
        clock.clone(),
        config.lease.ttl,
    );
    let owner = config.lease.owner_name();
    let lease = store.acquire(&pipeline_id, &owner).await?;

    let root = CancellationToken::new();
    let reader_cancel = root.child_token();
    let mut reader = LogReader::new(source.clone(), config.source_retry.clone(), reader_cancel.clone());
    let state = match prepare(&config, &store, &lease, &bindings, &mut reader).await {
        Ok(state) => state,
        Err(e) => {
            warn!(pipeline_id = %pipeline_id, error = %e, "Pipeline failed to start");
            if let Err(release) = store.release(lease).await {
                warn!(error = %release, "Failed to release lease");
            }
            return Err(e);
        }
    };

    let worker_config = WorkerConfig {
        queue_capacity: config.queue.sink_queue_capacity,
        batch_max_events: config.queue.batch_max_events,
        retry: config.sink_retry.clone(),
    };
    let mut sinks = BTreeMap::new();
    for writer in writers {
        let id = writer.id().clone();
        let resume = state.sink_resume_position(&id);
        let handle = SinkWorker::spawn(writer, resume, worker_config.clone(), root.child_token());
        sinks.insert(id, handle);
    }

    let checkpointer = Checkpointer::new(
        config.checkpoint.clone(),
        clock.clone(),
        sinks.keys().cloned(),
        state.last_confirmed_position,
        state.sink_positions.clone(),
    );

    let (pause_tx, pause_rx) = watch::channel(false);
    let progress = Arc::new(ReadProgress::default());
    let read_loop = ReadLoop {
        reader,
        decoder: EventDecoder::new(config.decode_failure),
        router: Router::new(Arc::new(bindings)),
        senders: sinks.iter().map(|(id, h)| (id.clone(), h.sender())).collect(),
        progress: progress.clone(),
        paused: pause_rx,
        cancel: reader_cancel.clone(),
    };
    let reader_join = tokio::spawn(read_loop.run());

    let (command_tx, command_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(PipelineStatus::starting(pipeline_id.clone()));

    info!(
        pipeline_id = %pipeline_id,
        owner = %owner,
        epoch = lease.epoch(),
        resume_after = ?state.last_confirmed_position,
        sinks = sinks.len(),
        "Pipeline running"
    );

    let now = clock.now();
    let coordinator = Coordinator {
        config,
        clock,
        source,
        store,
        lease: Some(lease),
        state,
        checkpointer,
        sinks,
        reader: Some(reader_join),
        reader_cancel,
        progress,
        dispatched_seen: 0,
        acks: FuturesUnordered::new(),
        commands: command_rx,
        status_tx,
        pause_tx,
        phase: PipelinePhase::Running,
        reason: None,
        head: None,
        last_renewal: now,
    };
    coordinator.publish_status();
    let join = tokio::spawn(coordinator.run());

    Ok(PipelineHandle {
        pipeline_id,
        commands: command_tx,
        status: status_rx,
        cancel: root,
        join: Some(join),
    })
}

/// Load or create the stored state and open the reader at the resume point.
async fn prepare(
    config: &PipelineConfig,
    store: &PositionStore,
    lease: &Lease,
    bindings: &SinkBindings,
    reader: &mut LogReader,
) -> Result<PipelineState, PipelineError> {
    let state = match store.load(&config.pipeline_id).await? {
        Some(state) => {
            if !bindings.matches_persisted(&state.sink_bindings) {
                return Err(PipelineError::BindingsChanged {
                    pipeline_id: config.pipeline_id.clone(),
                    stored: format!("{:?}", state.sink_bindings),
                    configured: format!("{:?}", bindings.to_persisted()),
                });
            }
            state
        }
        None => {
            info!(pipeline_id = %config.pipeline_id, "No stored position; first run");
            let initial = PipelineState::new(config.pipeline_id.clone(), bindings.to_persisted());
            store.commit(lease, &initial).await?
        }
    };

    let from = match state.last_confirmed_position {
        Some(position) => StartPosition::At(position),
        None => config.start,
    };
    reader.open(from).await?;
    Ok(state)
}

struct Coordinator {
    config: PipelineConfig,
    clock: SharedClock,
    source: SharedSource,
    store: PositionStore,
    lease: Option<Lease>,
    state: PipelineState,
    checkpointer: Checkpointer,
    sinks: BTreeMap<SinkId, SinkHandle>,
    reader: Option<JoinHandle<ReadExit>>,
    reader_cancel: CancellationToken,
    progress: Arc<ReadProgress>,
    dispatched_seen: u64,
    acks: FuturesUnordered<BoxFuture<'static, BarrierAck>>,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<PipelineStatus>,
    pause_tx: watch::Sender<bool>,
    phase: PipelinePhase,
    reason: Option<String>,
    head: Option<Position>,
    last_renewal: Timestamp,
}

async fn join_reader(reader: &mut Option<JoinHandle<ReadExit>>) -> ReadExit {
    match reader {
        Some(join) => match join.await {
            Ok(exit) => exit,
            Err(e) => ReadExit::Failed(PipelineError::TaskFailed(format!("read loop: {}", e))),
        },
        None => std::future::pending().await,
    }
}

impl Coordinator {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        let result = self.stop().await;
                        if let Err(e) = &result {
                            self.fail_with(e.reason()).await;
                        }
                        let _ = reply.send(result);
                        return;
                    }
                    Some(command) => {
                        self.handle(command);
                        Ok(())
                    }
                    None => {
                        // Every handle is gone; nobody can stop us later.
                        if let Err(e) = self.stop().await {
                            self.fail_with(e.reason()).await;
                        }
                        return;
                    }
                },
                exit = join_reader(&mut self.reader) => {
                    self.reader = None;
                    match exit {
                        ReadExit::Cancelled => Ok(()),
                        ReadExit::Failed(e) => Err(e),
                    }
                },
                Some(ack) = self.acks.next(), if !self.acks.is_empty() => self.on_ack(ack).await,
                _ = tick.tick() => self.on_tick().await,
            };

            if let Err(e) = result {
                self.fail_with(e.reason()).await;
                return;
            }
            self.publish_status();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Pause { reply } => {
                if self.phase == PipelinePhase::Running {
                    self.pause_tx.send_replace(true);
                    self.phase = PipelinePhase::Paused;
                    info!(pipeline_id = %self.config.pipeline_id, "Pipeline paused");
                }
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                if self.phase == PipelinePhase::Paused {
                    self.pause_tx.send_replace(false);
                    self.phase = PipelinePhase::Running;
                    info!(pipeline_id = %self.config.pipeline_id, "Pipeline resumed");
                }
                let _ = reply.send(());
            }
            Command::Stop { .. } => {}
        }
    }

    async fn on_tick(&mut self) -> Result<(), PipelineError> {
        self.observe_progress();
        match self.source.current_head_position().await {
            Ok(head) => self.head = head,
            Err(e) => debug!(error = %e, "Head position unavailable"),
        }
        if let Some(action) = self.checkpointer.poll() {
            self.execute(action).await?;
        }
        self.renew_lease_if_due().await
    }

    fn observe_progress(&mut self) {
        let Some(highest) = self.progress.highest() else {
            return;
        };
        let dispatched = self.progress.dispatched.load(Ordering::Relaxed);
        let events = dispatched.saturating_sub(self.dispatched_seen);
        self.dispatched_seen = dispatched;
        self.checkpointer.record_dispatched(highest, events);
    }

    async fn on_ack(&mut self, ack: BarrierAck) -> Result<(), PipelineError> {
        match self.checkpointer.record_ack(&ack) {
            Ok(Some(action)) => self.execute(action).await,
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Ignoring barrier acknowledgement");
                Ok(())
            }
        }
    }

    async fn execute(&mut self, action: CheckpointAction) -> Result<(), PipelineError> {
        match action {
            CheckpointAction::Barrier(request) => {
                self.send_barrier(request);
                Ok(())
            }
            CheckpointAction::Persist(request) => self.persist(request).await,
        }
    }

    fn send_barrier(&mut self, request: BarrierRequest) {
        for sink in &request.sinks {
            let Some(handle) = self.sinks.get(sink) else {
                continue;
            };
            let sender = handle.sender();
            let (checkpoint_id, position) = (request.checkpoint_id, request.position);
            self.acks
                .push(Box::pin(async move { sender.barrier(checkpoint_id, position).await }));
        }
    }

    /// Write positions to the store. A transient failure leaves the
    /// request with the checkpointer for the next tick.
    async fn persist(&mut self, request: PersistRequest) -> Result<(), PipelineError> {
        let Some(lease) = &self.lease else {
            return Ok(());
        };
        let mut next = self.state.clone();
        next.last_confirmed_position = next.last_confirmed_position.max(request.global);
        for (sink, position) in &request.sink_positions {
            let entry = next.sink_positions.entry(sink.clone()).or_insert(*position);
            if *position > *entry {
                *entry = *position;
            }
        }

        match self.store.commit(lease, &next).await {
            Ok(stored) => {
                self.state = stored;
                self.checkpointer.persisted(&request);
                if let Some(checkpoint) = &request.checkpoint {
                    debug!(
                        checkpoint_id = checkpoint.id,
                        position = %checkpoint.barrier_position,
                        "Checkpoint persisted"
                    );
                    for handle in self.sinks.values() {
                        handle.sender().checkpointed(checkpoint.barrier_position);
                    }
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Failed to persist positions; will retry");
                self.checkpointer.persist_failed();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease_if_due(&mut self) -> Result<(), PipelineError> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(());
        };
        if !self.clock.has_elapsed(self.last_renewal, self.store.ttl() / 3) {
            return Ok(());
        }
        match self.store.renew(lease).await {
            Ok(()) => {
                self.last_renewal = self.clock.now();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Lease renewal failed; will retry");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drain_acks(&mut self, deadline: Instant) -> Result<(), PipelineError> {
        while !self.acks.is_empty() {
            match tokio::time::timeout_at(deadline, self.acks.next()).await {
                Ok(Some(ack)) => self.on_ack(ack).await?,
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = self.acks.len(), "Timed out waiting for barrier acknowledgements");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Graceful stop: stop reading, confirm what was dispatched, flush the
    /// sinks and give up the lease.
    async fn stop(&mut self) -> Result<StopReport, PipelineError> {
        info!(pipeline_id = %self.config.pipeline_id, "Stopping pipeline");
        let deadline = Instant::now() + self.config.shutdown_timeout;

        self.reader_cancel.cancel();
        if let Some(join) = self.reader.take() {
            match join.await {
                Ok(ReadExit::Failed(e)) => warn!(error = %e, "Read loop failed during shutdown"),
                Ok(ReadExit::Cancelled) => {}
                Err(e) => warn!(error = %e, "Read loop ended abnormally"),
            }
        }
        self.observe_progress();

        self.drain_acks(deadline).await?;
        if let Some(request) = self.checkpointer.force_barrier() {
            self.send_barrier(request);
        }
        self.drain_acks(deadline).await?;
        let request = self.checkpointer.final_persist();
        self.persist(request).await?;

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        let reports = futures::future::join_all(
            self.sinks.values_mut().map(|handle| handle.shutdown(remaining)),
        )
        .await;
        let all_flushed = reports.iter().all(|r| r.is_some());
        let sinks: Vec<SinkReport> = reports.into_iter().flatten().collect();

        self.release_lease().await;
        self.phase = PipelinePhase::Stopped;

        let highest_dispatched = self.checkpointer.highest_dispatched();
        let last_confirmed_position = self.state.last_confirmed_position;
        let clean = all_flushed
            && !self.checkpointer.has_outstanding()
            && last_confirmed_position >= highest_dispatched;
        if !clean {
            warn!(
                confirmed = ?last_confirmed_position,
                dispatched = ?highest_dispatched,
                "Events past the confirmed position will replay on restart"
            );
        }
        info!(
            pipeline_id = %self.config.pipeline_id,
            confirmed = ?last_confirmed_position,
            "Pipeline stopped"
        );
        self.publish_status();

        Ok(StopReport {
            last_confirmed_position,
            highest_dispatched,
            sinks,
            clean,
        })
    }

    async fn fail_with(&mut self, reason: String) {
        error!(pipeline_id = %self.config.pipeline_id, reason = %reason, "Pipeline failed");
        self.reader_cancel.cancel();
        if let Some(join) = self.reader.take() {
            join.abort();
        }
        for handle in self.sinks.values_mut() {
            handle.abort();
        }
        self.acks = FuturesUnordered::new();
        self.release_lease().await;
        self.phase = PipelinePhase::Failed;
        self.reason = Some(reason);
        self.publish_status();
    }

    async fn release_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.store.release(lease).await {
                warn!(error = %e, "Failed to release lease");
            }
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn status(&self) -> PipelineStatus {
        let sinks: Vec<SinkLag> = self
            .sinks
            .values()
            .map(|handle| {
                let status = handle.status();
                let lag = status::lag(self.head, status.durable_through.max(status.acked_through));
                SinkLag { status, lag }
            })
            .collect();
        let degraded_sinks: Vec<SinkId> = sinks
            .iter()
            .filter(|s| s.status.health == SinkHealth::Degraded)
            .map(|s| s.status.id.clone())
            .collect();

        let phase = match self.phase {
            PipelinePhase::Running if !degraded_sinks.is_empty() => PipelinePhase::Degraded,
            phase => phase,
        };
        let reason = match (&self.reason, phase) {
            (Some(reason), _) => Some(reason.clone()),
            (None, PipelinePhase::Degraded) => {
                let reasons: Vec<String> = sinks
                    .iter()
                    .filter_map(|s| {
                        s.status
                            .degraded_reason
                            .as_ref()
                            .map(|r| format!("{}: {}", s.status.id, r))
                    })
                    .collect();
                Some(reasons.join("; "))
            }
            (None, _) => None,
        };

        let last_confirmed = self.state.last_confirmed_position;
        PipelineStatus {
            pipeline_id: self.config.pipeline_id.clone(),
            phase,
            reason,
            head_position: self.head,
            last_confirmed_position: last_confirmed,
            highest_dispatched: self.progress.highest(),
            lag: status::lag(self.head, last_confirmed),
            degraded_sinks,
            sinks,
            checkpoint: Some(self.checkpointer.status()),
            records_read: self.progress.records.load(Ordering::Relaxed),
            events_decoded: self.progress.decoded.load(Ordering::Relaxed),
            records_skipped: self.progress.skipped.load(Ordering::Relaxed),
            events_unrouted: self.progress.unrouted.load(Ordering::Relaxed),
            source_reconnects: self.progress.reconnects.load(Ordering::Relaxed),
            lease_epoch: self.lease.as_ref().map(|l| l.epoch()),
        }
    }
}

/// Control handle for a running pipeline.
///
/// Dropping the handle stops the pipeline gracefully in the background.
pub struct PipelineHandle {
    pipeline_id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PipelineStatus>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    /// Status updates, published after every control loop step.
    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    fn not_running(&self) -> PipelineError {
        let status = self.status();
        PipelineError::NotRunning {
            phase: status.phase,
            reason: status.reason,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PipelineError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(command(reply)).await.is_err() {
            return Err(self.not_running());
        }
        rx.await.map_err(|_| self.not_running())
    }

    /// Stop reading. Sinks drain what is already queued and checkpoints
    /// continue.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    pub async fn stop(mut self) -> Result<StopReport, PipelineError> {
        let result = self
            .request(|reply| Command::Stop { reply })
            .await
            .and_then(|r| r);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
        result
    }

    /// Tear everything down at once without flushing, persisting or
    /// releasing the lease, as a process crash would.
    pub async fn abort(mut self) {
        warn!(pipeline_id = %self.pipeline_id, "Aborting pipeline");
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            join.abort();
            let _ = join.await;
        }
    }

    /// Wait until `predicate` holds. On timeout returns the last status seen.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&PipelineStatus) -> bool,
    ) -> Result<PipelineStatus, PipelineStatus> {
        let mut rx = self.status.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|status| predicate(status))
                .await
                .map(|status| status.clone())
        })
        .await;
        match waited {
            Ok(Ok(status)) => Ok(status),
            _ => Err(self.status()),
        }
    }
}
