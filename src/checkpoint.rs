//! Checkpointer: barrier-based confirmation of durable progress.
//!
//! ## State machine
//!
//! ```text
//! IDLE ──(interval or event threshold, new data)──► BARRIER_ISSUED
//!   ▲                                                    │
//!   │                                    every sink acks ≥ barrier
//!   │                                                    ▼
//!   └───────────────(position persisted)───────────── CONFIRMED
//! ```
//!
//! The checkpointer holds no I/O. The coordinator feeds it dispatch
//! progress and barrier acknowledgements and carries out the actions it
//! returns: send a barrier, or persist positions.
//!
//! A sink that never acknowledges keeps the checkpoint in
//! BARRIER_ISSUED. Past `stall_threshold` the checkpoint is reported as
//! stalled, and healthy sinks keep receiving progress barriers on each
//! interval so their own watermarks still advance and get persisted. The
//! global position never moves past the lowest sink watermark.

use crate::clock::{SharedClock, Timestamp};
use crate::event::Position;
use crate::router::SinkId;
use crate::sink::{BarrierAck, BarrierOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    #[serde(with = "crate::pipeline::config::duration_millis")]
    pub interval: Duration,
    /// Events dispatched since the last barrier that force a new one.
    pub event_threshold: u64,
    /// How long a barrier may stay unacknowledged before it counts as stalled.
    #[serde(with = "crate::pipeline::config::duration_millis")]
    pub stall_threshold: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            interval: Duration::from_secs(5),
            event_threshold: 10_000,
            stall_threshold: Duration::from_secs(60),
        }
    }
}

impl CheckpointConfig {
    pub fn test() -> Self {
        CheckpointConfig {
            interval: Duration::from_millis(50),
            event_threshold: 100,
            stall_threshold: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub barrier_position: Position,
    pub issued_at: Timestamp,
    pub confirmed_at: Option<Timestamp>,
    pub state: CheckpointState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    Idle,
    BarrierIssued,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRequest {
    pub checkpoint_id: u64,
    pub position: Position,
    pub sinks: Vec<SinkId>,
}

/// Positions to write to the position store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub global: Option<Position>,
    pub sink_positions: BTreeMap<SinkId, Position>,
    /// Set when this persist confirms a checkpoint.
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointAction {
    Barrier(BarrierRequest),
    Persist(PersistRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    UnknownSink(SinkId),
    /// Ack names a barrier that was never issued.
    UnknownBarrier { sink: SinkId, checkpoint_id: u64 },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::UnknownSink(sink) => write!(f, "ack from unknown sink {}", sink),
            CheckpointError::UnknownBarrier {
                sink,
                checkpoint_id,
            } => write!(f, "sink {} acked unknown barrier {}", sink, checkpoint_id),
        }
    }
}

impl std::error::Error for CheckpointError {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub barriers_issued: u64,
    pub progress_barriers: u64,
    pub confirmed: u64,
    pub stalls: u64,
    pub persist_failures: u64,
}

/// Serializable view for pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStatus {
    pub phase: CheckpointPhase,
    pub current: Option<Checkpoint>,
    pub last_confirmed: Option<Checkpoint>,
    pub confirmed_position: Option<Position>,
    pub highest_dispatched: Option<Position>,
    pub pending_sinks: Vec<SinkId>,
    pub degraded_sinks: Vec<SinkId>,
    pub stalled: bool,
    pub stalled_for_ms: Option<u64>,
    pub sink_watermarks: BTreeMap<SinkId, Position>,
    pub stats: CheckpointStats,
}

pub struct Checkpointer {
    config: CheckpointConfig,
    clock: SharedClock,
    sinks: BTreeSet<SinkId>,
    phase: CheckpointPhase,
    next_id: u64,
    current: Option<Checkpoint>,
    last_confirmed: Option<Checkpoint>,
    confirmed_position: Option<Position>,
    watermarks: BTreeMap<SinkId, Position>,
    /// Sinks with an unanswered barrier.
    outstanding: BTreeMap<SinkId, u64>,
    degraded: BTreeMap<SinkId, String>,
    highest_dispatched: Option<Position>,
    dispatched_since_barrier: u64,
    last_barrier_at: Timestamp,
    stalled_since: Option<Timestamp>,
    /// Watermarks changed since the last persist.
    watermarks_dirty: bool,
    unpersisted: Option<PersistRequest>,
    stats: CheckpointStats,
}

impl Checkpointer {
    /// Resume from a stored global position and per-sink watermarks.
    pub fn new(
        config: CheckpointConfig,
        clock: SharedClock,
        sinks: impl IntoIterator<Item = SinkId>,
        confirmed: Option<Position>,
        watermarks: BTreeMap<SinkId, Position>,
    ) -> Self {
        let sinks: BTreeSet<SinkId> = sinks.into_iter().collect();
        let watermarks = watermarks
            .into_iter()
            .filter(|(sink, _)| sinks.contains(sink))
            .collect();
        let now = clock.now();
        Checkpointer {
            config,
            clock,
            sinks,
            phase: CheckpointPhase::Idle,
            next_id: 1,
            current: None,
            last_confirmed: None,
            confirmed_position: confirmed,
            watermarks,
            outstanding: BTreeMap::new(),
            degraded: BTreeMap::new(),
            highest_dispatched: confirmed,
            dispatched_since_barrier: 0,
            last_barrier_at: now,
            stalled_since: None,
            watermarks_dirty: false,
            unpersisted: None,
            stats: CheckpointStats::default(),
        }
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    pub fn confirmed_position(&self) -> Option<Position> {
        self.confirmed_position
    }

    pub fn highest_dispatched(&self) -> Option<Position> {
        self.highest_dispatched
    }

    pub fn watermark(&self, sink: &SinkId) -> Option<Position> {
        self.watermarks.get(sink).copied()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    pub fn stats(&self) -> &CheckpointStats {
        &self.stats
    }

    /// Every event up to `highest` has been handed to its sinks' queues.
    /// `events` counts dispatches since the previous call, routed or not.
    pub fn record_dispatched(&mut self, highest: Position, events: u64) {
        if self.highest_dispatched.map_or(true, |h| highest > h) {
            self.highest_dispatched = Some(highest);
        }
        self.dispatched_since_barrier += events;
    }

    fn has_new_data(&self) -> bool {
        self.highest_dispatched > self.confirmed_position
    }

    fn interval_elapsed(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_barrier_at) >= self.config.interval
    }

    /// Periodic step. Returns the next action, if any.
    pub fn poll(&mut self) -> Option<CheckpointAction> {
        if let Some(request) = &self.unpersisted {
            return Some(CheckpointAction::Persist(request.clone()));
        }
        let now = self.clock.now();
        match self.phase {
            CheckpointPhase::Idle => {
                let due = self.interval_elapsed(now)
                    || self.dispatched_since_barrier >= self.config.event_threshold;
                if due && self.has_new_data() {
                    return self.issue_checkpoint(now).map(CheckpointAction::Barrier);
                }
                None
            }
            CheckpointPhase::BarrierIssued => {
                self.check_stall(now);
                if self.stalled_since.is_some() {
                    if self.watermarks_dirty {
                        return Some(CheckpointAction::Persist(self.watermark_persist()));
                    }
                    if self.interval_elapsed(now) {
                        return self.issue_progress_barrier(now).map(CheckpointAction::Barrier);
                    }
                }
                None
            }
            // Waiting on the coordinator's persist.
            CheckpointPhase::Confirmed => None,
        }
    }

    /// Issue a barrier now if there is unconfirmed data and none is in
    /// flight. Used for the final checkpoint on shutdown.
    pub fn force_barrier(&mut self) -> Option<BarrierRequest> {
        if self.phase != CheckpointPhase::Idle || !self.has_new_data() {
            return None;
        }
        let now = self.clock.now();
        self.issue_checkpoint(now)
    }

    /// Whether barriers are still unanswered.
    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    fn healthy_targets(&self) -> Vec<SinkId> {
        self.sinks
            .iter()
            .filter(|sink| !self.outstanding.contains_key(*sink))
            .cloned()
            .collect()
    }

    fn issue_checkpoint(&mut self, now: Timestamp) -> Option<BarrierRequest> {
        let position = self.highest_dispatched?;
        let id = self.next_id;
        self.next_id += 1;
        self.current = Some(Checkpoint {
            id,
            barrier_position: position,
            issued_at: now,
            confirmed_at: None,
            state: CheckpointState::Pending,
        });
        self.phase = CheckpointPhase::BarrierIssued;
        self.last_barrier_at = now;
        self.dispatched_since_barrier = 0;
        self.stats.barriers_issued += 1;

        // Sinks already at the barrier (nothing routed to them since) still
        // get the barrier so their writers flush.
        let sinks = self.healthy_targets();
        for sink in &sinks {
            self.outstanding.insert(sink.clone(), id);
        }
        debug!(checkpoint_id = id, position = %position, sinks = sinks.len(), "Barrier issued");

        if sinks.is_empty() {
            // Every sink is busy with an earlier barrier; wait for those acks.
            return None;
        }
        Some(BarrierRequest {
            checkpoint_id: id,
            position,
            sinks,
        })
    }

    fn issue_progress_barrier(&mut self, now: Timestamp) -> Option<BarrierRequest> {
        let position = self.highest_dispatched?;
        let sinks: Vec<SinkId> = self
            .healthy_targets()
            .into_iter()
            .filter(|sink| !self.degraded.contains_key(sink))
            .filter(|sink| self.watermarks.get(sink).map_or(true, |w| *w < position))
            .collect();
        self.last_barrier_at = now;
        if sinks.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        for sink in &sinks {
            self.outstanding.insert(sink.clone(), id);
        }
        self.stats.progress_barriers += 1;
        debug!(barrier_id = id, position = %position, sinks = sinks.len(), "Progress barrier issued");
        Some(BarrierRequest {
            checkpoint_id: id,
            position,
            sinks,
        })
    }

    fn check_stall(&mut self, now: Timestamp) {
        let Some(current) = &self.current else {
            return;
        };
        if self.stalled_since.is_none()
            && now.saturating_sub(current.issued_at) >= self.config.stall_threshold
        {
            self.stalled_since = Some(now);
            self.stats.stalls += 1;
            warn!(
                checkpoint_id = current.id,
                position = %current.barrier_position,
                pending = ?self.pending_sinks(),
                degraded = ?self.degraded.keys().collect::<Vec<_>>(),
                "Checkpoint stalled"
            );
        }
    }

    /// Sinks whose watermark is still below the current barrier.
    pub fn pending_sinks(&self) -> Vec<SinkId> {
        let Some(current) = &self.current else {
            return Vec::new();
        };
        self.sinks
            .iter()
            .filter(|sink| {
                self.watermarks
                    .get(*sink)
                    .map_or(true, |w| *w < current.barrier_position)
            })
            .cloned()
            .collect()
    }

    pub fn degraded_sinks(&self) -> Vec<SinkId> {
        self.degraded.keys().cloned().collect()
    }

    /// Apply a sink's barrier answer.
    pub fn record_ack(&mut self, ack: &BarrierAck) -> Result<Option<CheckpointAction>, CheckpointError> {
        if !self.sinks.contains(&ack.sink) {
            return Err(CheckpointError::UnknownSink(ack.sink.clone()));
        }
        if ack.checkpoint_id == 0 || ack.checkpoint_id >= self.next_id {
            return Err(CheckpointError::UnknownBarrier {
                sink: ack.sink.clone(),
                checkpoint_id: ack.checkpoint_id,
            });
        }
        if self.outstanding.get(&ack.sink) == Some(&ack.checkpoint_id) {
            self.outstanding.remove(&ack.sink);
        }

        match &ack.outcome {
            BarrierOutcome::Durable(position) => {
                let entry = self.watermarks.entry(ack.sink.clone()).or_insert(*position);
                if *position > *entry {
                    *entry = *position;
                }
                self.watermarks_dirty = true;
            }
            BarrierOutcome::Degraded(reason) => {
                if self.degraded.insert(ack.sink.clone(), reason.clone()).is_none() {
                    warn!(sink = %ack.sink, reason = %reason, "Sink holds back checkpoints");
                }
            }
        }

        if self.phase != CheckpointPhase::BarrierIssued {
            return Ok(None);
        }
        if self.pending_sinks().is_empty() {
            return Ok(self.confirm().map(CheckpointAction::Persist));
        }
        Ok(self.catch_up(&ack.sink).map(CheckpointAction::Barrier))
    }

    /// A sink that answered an older barrier while the current one was
    /// issued gets the current barrier now.
    fn catch_up(&mut self, sink: &SinkId) -> Option<BarrierRequest> {
        let current = self.current.as_ref()?;
        let behind = self
            .watermarks
            .get(sink)
            .map_or(true, |w| *w < current.barrier_position);
        if !behind || self.outstanding.contains_key(sink) || self.degraded.contains_key(sink) {
            return None;
        }
        let request = BarrierRequest {
            checkpoint_id: current.id,
            position: current.barrier_position,
            sinks: vec![sink.clone()],
        };
        self.outstanding.insert(sink.clone(), current.id);
        Some(request)
    }

    fn confirm(&mut self) -> Option<PersistRequest> {
        let now = self.clock.now();
        let checkpoint = self.current.as_mut()?;
        checkpoint.state = CheckpointState::Confirmed;
        checkpoint.confirmed_at = Some(now);
        let checkpoint = checkpoint.clone();
        self.phase = CheckpointPhase::Confirmed;
        info!(
            checkpoint_id = checkpoint.id,
            position = %checkpoint.barrier_position,
            "Checkpoint confirmed"
        );
        let request = PersistRequest {
            global: Some(checkpoint.barrier_position),
            sink_positions: self.watermarks.clone(),
            checkpoint: Some(checkpoint),
        };
        self.unpersisted = Some(request.clone());
        Some(request)
    }

    fn watermark_persist(&mut self) -> PersistRequest {
        let request = PersistRequest {
            global: self.confirmed_position,
            sink_positions: self.watermarks.clone(),
            checkpoint: None,
        };
        self.unpersisted = Some(request.clone());
        request
    }

    /// The coordinator stored `request`.
    pub fn persisted(&mut self, request: &PersistRequest) {
        if self.unpersisted.as_ref() == Some(request) {
            self.unpersisted = None;
        }
        self.watermarks_dirty = false;
        let Some(checkpoint) = &request.checkpoint else {
            return;
        };
        self.confirmed_position = self.confirmed_position.max(Some(checkpoint.barrier_position));
        self.last_confirmed = Some(checkpoint.clone());
        self.stats.confirmed += 1;
        if self.current.as_ref().map(|c| c.id) == Some(checkpoint.id) {
            self.current = None;
            self.phase = CheckpointPhase::Idle;
            self.stalled_since = None;
        }

        #[cfg(debug_assertions)]
        self.verify_invariants();
    }

    /// The store write failed; the same request is returned by the next poll.
    pub fn persist_failed(&mut self) {
        self.stats.persist_failures += 1;
    }

    /// Positions to persist on shutdown: whatever is confirmed plus all
    /// known sink watermarks.
    pub fn final_persist(&mut self) -> PersistRequest {
        if let Some(request) = &self.unpersisted {
            return request.clone();
        }
        self.watermark_persist()
    }

    pub fn status(&self) -> CheckpointStatus {
        let now = self.clock.now();
        CheckpointStatus {
            phase: self.phase,
            current: self.current.clone(),
            last_confirmed: self.last_confirmed.clone(),
            confirmed_position: self.confirmed_position,
            highest_dispatched: self.highest_dispatched,
            pending_sinks: self.pending_sinks(),
            degraded_sinks: self.degraded_sinks(),
            stalled: self.stalled_since.is_some(),
            stalled_for_ms: self
                .current
                .as_ref()
                .filter(|_| self.stalled_since.is_some())
                .map(|c| now.saturating_sub(c.issued_at).as_millis() as u64),
            sink_watermarks: self.watermarks.clone(),
            stats: self.stats.clone(),
        }
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        if let Some(confirmed) = self.confirmed_position {
            for sink in &self.sinks {
                let watermark = self.watermarks.get(sink).copied();
                debug_assert!(
                    watermark.is_some_and(|w| w >= confirmed),
                    "confirmed {} ahead of sink {} watermark {:?}",
                    confirmed,
                    sink,
                    watermark
                );
            }
            debug_assert!(self.highest_dispatched >= Some(confirmed));
        }
    }
}
