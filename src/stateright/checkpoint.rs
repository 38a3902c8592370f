//! Stateright model of barrier checkpoints.
//!
//! Positions are dispatched in order into bounded per-sink queues. A barrier
//! travels through the same queues; a healthy sink answers it after making
//! everything before it durable, a degraded sink answers it without doing
//! so. Once every sink has answered, healthy sinks record their own
//! watermark and the global checkpoint advances only if no sink is degraded.
//! A crash drops queues and staged writes, and restarts reading after the
//! checkpoint.
//!
//! Verified properties:
//! - CHECKPOINT_SAFE: every position at or below the checkpoint is durable
//!   in every sink it was routed to
//! - SINK_WATERMARK_SAFE: the same for each sink's own watermark
//! - EXACTLY_ONCE: a sink never holds a position twice, or out of order
//! - CHECKPOINT_MONOTONIC: the checkpoint never moves backwards

use ::stateright::{Model, Property};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueItem {
    Event(u8),
    Barrier(u8),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BarrierAnswer {
    Durable(u8),
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckpointState {
    /// Highest position handed to the sinks.
    pub dispatched: u8,
    pub queues: Vec<Vec<QueueItem>>,
    /// Accepted but not yet durable.
    pub staged: Vec<Vec<u8>>,
    /// Durable positions, in write order.
    pub durable: Vec<Vec<u8>>,
    /// Positions a sink skips after a restart.
    pub resume: Vec<u8>,
    pub degraded: Vec<bool>,
    pub answers: Vec<Option<BarrierAnswer>>,
    pub pending_barrier: Option<u8>,
    pub last_barrier: u8,
    /// Stored global checkpoint; 0 means none.
    pub confirmed: u8,
    /// Highest checkpoint ever stored.
    pub confirmed_high: u8,
    pub sink_positions: Vec<u8>,
    pub failures: u8,
    pub crashes: u8,
}

impl CheckpointState {
    fn new(sinks: usize) -> Self {
        CheckpointState {
            dispatched: 0,
            queues: vec![Vec::new(); sinks],
            staged: vec![Vec::new(); sinks],
            durable: vec![Vec::new(); sinks],
            resume: vec![0; sinks],
            degraded: vec![false; sinks],
            answers: vec![None; sinks],
            pending_barrier: None,
            last_barrier: 0,
            confirmed: 0,
            confirmed_high: 0,
            sink_positions: vec![0; sinks],
            failures: 0,
            crashes: 0,
        }
    }

    fn durable_through(&self, sink: usize) -> u8 {
        self.durable[sink].last().copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CheckpointAction {
    Dispatch,
    Process { sink: usize },
    Flush { sink: usize },
    IssueBarrier,
    Persist,
    FailSink { sink: usize },
    Crash,
}

pub struct CheckpointModel {
    /// Positions 1..=positions exist in the source.
    pub positions: u8,
    /// `routes[p - 1]` lists the sinks position `p` is routed to.
    pub routes: Vec<Vec<usize>>,
    pub sinks: usize,
    pub queue_capacity: usize,
    pub max_failures: u8,
    pub max_crashes: u8,
}

impl CheckpointModel {
    /// Two sinks; position 2 is routed only to sink 0 and position 3 to none.
    pub fn new() -> Self {
        CheckpointModel {
            positions: 4,
            routes: vec![vec![0, 1], vec![0], vec![], vec![0, 1]],
            sinks: 2,
            queue_capacity: 2,
            max_failures: 1,
            max_crashes: 1,
        }
    }

    fn routed(&self, position: u8, sink: usize) -> bool {
        position >= 1
            && self
                .routes
                .get(position as usize - 1)
                .map_or(false, |sinks| sinks.contains(&sink))
    }

    fn process(&self, state: &mut CheckpointState, sink: usize, item: QueueItem) {
        match item {
            QueueItem::Event(p) => {
                let skip = p <= state.resume[sink] || p <= state.durable_through(sink);
                if !state.degraded[sink] && !skip {
                    state.staged[sink].push(p);
                }
            }
            QueueItem::Barrier(p) => {
                let answer = if state.degraded[sink] {
                    BarrierAnswer::Degraded
                } else {
                    let staged = std::mem::take(&mut state.staged[sink]);
                    state.durable[sink].extend(staged);
                    BarrierAnswer::Durable(p)
                };
                state.answers[sink] = Some(answer);
            }
        }
    }
}

impl Default for CheckpointModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for CheckpointModel {
    type State = CheckpointState;
    type Action = CheckpointAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![CheckpointState::new(self.sinks)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        if state.dispatched < self.positions {
            let next = state.dispatched + 1;
            let room = (0..self.sinks)
                .filter(|s| self.routed(next, *s))
                .all(|s| state.queues[s].len() < self.queue_capacity);
            if room {
                actions.push(CheckpointAction::Dispatch);
            }
        }
        for sink in 0..self.sinks {
            if !state.queues[sink].is_empty() {
                actions.push(CheckpointAction::Process { sink });
            }
            if !state.staged[sink].is_empty() && !state.degraded[sink] {
                actions.push(CheckpointAction::Flush { sink });
            }
            if state.failures < self.max_failures && !state.degraded[sink] {
                actions.push(CheckpointAction::FailSink { sink });
            }
        }
        if state.pending_barrier.is_none() && state.dispatched > state.last_barrier {
            actions.push(CheckpointAction::IssueBarrier);
        }
        if state.pending_barrier.is_some() && state.answers.iter().all(|a| a.is_some()) {
            actions.push(CheckpointAction::Persist);
        }
        if state.crashes < self.max_crashes {
            actions.push(CheckpointAction::Crash);
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            CheckpointAction::Dispatch => {
                next.dispatched += 1;
                let position = next.dispatched;
                for sink in 0..self.sinks {
                    if self.routed(position, sink) {
                        next.queues[sink].push(QueueItem::Event(position));
                    }
                }
            }
            CheckpointAction::Process { sink } => {
                if next.queues[sink].is_empty() {
                    return None;
                }
                let item = next.queues[sink].remove(0);
                self.process(&mut next, sink, item);
            }
            CheckpointAction::Flush { sink } => {
                let staged = std::mem::take(&mut next.staged[sink]);
                next.durable[sink].extend(staged);
            }
            CheckpointAction::IssueBarrier => {
                let position = next.dispatched;
                next.pending_barrier = Some(position);
                next.last_barrier = position;
                for queue in next.queues.iter_mut() {
                    queue.push(QueueItem::Barrier(position));
                }
            }
            CheckpointAction::Persist => {
                let position = next.pending_barrier.take()?;
                let mut all_durable = true;
                for sink in 0..self.sinks {
                    match next.answers[sink].take() {
                        Some(BarrierAnswer::Durable(p)) => {
                            next.sink_positions[sink] = next.sink_positions[sink].max(p)
                        }
                        _ => all_durable = false,
                    }
                }
                if all_durable {
                    next.confirmed = next.confirmed.max(position);
                    next.confirmed_high = next.confirmed_high.max(next.confirmed);
                }
            }
            CheckpointAction::FailSink { sink } => {
                next.degraded[sink] = true;
                next.failures += 1;
            }
            CheckpointAction::Crash => {
                next.crashes += 1;
                for sink in 0..self.sinks {
                    next.queues[sink].clear();
                    next.staged[sink].clear();
                    next.answers[sink] = None;
                    next.degraded[sink] = false;
                    next.resume[sink] = next.sink_positions[sink].max(next.confirmed);
                }
                next.pending_barrier = None;
                next.dispatched = next.confirmed;
                next.last_barrier = next.confirmed;
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("checkpoint_safe", |model: &CheckpointModel, state: &CheckpointState| {
                (1..=state.confirmed).all(|p| {
                    (0..model.sinks).all(|s| !model.routed(p, s) || state.durable[s].contains(&p))
                })
            }),
            Property::always("sink_watermark_safe", |model: &CheckpointModel, state: &CheckpointState| {
                (0..model.sinks).all(|s| {
                    (1..=state.sink_positions[s])
                        .all(|p| !model.routed(p, s) || state.durable[s].contains(&p))
                })
            }),
            Property::always("exactly_once", |_: &CheckpointModel, state: &CheckpointState| {
                state
                    .durable
                    .iter()
                    .all(|positions| positions.windows(2).all(|w| w[0] < w[1]))
            }),
            Property::always("checkpoint_monotonic", |_: &CheckpointModel, state: &CheckpointState| {
                state.confirmed == state.confirmed_high
            }),
            Property::always("routed_only", |model: &CheckpointModel, state: &CheckpointState| {
                (0..model.sinks).all(|s| state.durable[s].iter().all(|p| model.routed(*p, s)))
            }),
            Property::sometimes("fully_confirmed", |model: &CheckpointModel, state: &CheckpointState| {
                state.confirmed == model.positions
            }),
            Property::sometimes("confirmed_after_crash", |_: &CheckpointModel, state: &CheckpointState| {
                state.crashes > 0 && state.confirmed > 0
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(model: &CheckpointModel, state: &CheckpointState, action: CheckpointAction) -> CheckpointState {
        model.next_state(state, action).unwrap()
    }

    #[test]
    fn test_barrier_confirms_after_flush() {
        let model = CheckpointModel::new();
        let mut state = model.init_states().remove(0);
        state = step(&model, &state, CheckpointAction::Dispatch);
        state = step(&model, &state, CheckpointAction::IssueBarrier);
        for _ in 0..2 {
            state = step(&model, &state, CheckpointAction::Process { sink: 0 });
            state = step(&model, &state, CheckpointAction::Process { sink: 1 });
        }
        state = step(&model, &state, CheckpointAction::Persist);
        assert_eq!(state.confirmed, 1);
        assert_eq!(state.durable, vec![vec![1], vec![1]]);
    }

    #[test]
    fn test_degraded_sink_stalls_checkpoint() {
        let model = CheckpointModel::new();
        let mut state = model.init_states().remove(0);
        state = step(&model, &state, CheckpointAction::FailSink { sink: 1 });
        state = step(&model, &state, CheckpointAction::Dispatch);
        state = step(&model, &state, CheckpointAction::IssueBarrier);
        for _ in 0..2 {
            state = step(&model, &state, CheckpointAction::Process { sink: 0 });
            state = step(&model, &state, CheckpointAction::Process { sink: 1 });
        }
        state = step(&model, &state, CheckpointAction::Persist);
        assert_eq!(state.confirmed, 0);
        assert_eq!(state.sink_positions, vec![1, 0]);
        assert!(state.durable[1].is_empty());
    }

    #[test]
    fn test_crash_resumes_after_checkpoint() {
        let model = CheckpointModel::new();
        let mut state = model.init_states().remove(0);
        state = step(&model, &state, CheckpointAction::Dispatch);
        state = step(&model, &state, CheckpointAction::Dispatch);
        state = step(&model, &state, CheckpointAction::Process { sink: 0 });
        state = step(&model, &state, CheckpointAction::Flush { sink: 0 });
        state = step(&model, &state, CheckpointAction::Crash);
        assert_eq!(state.dispatched, 0);
        assert!(state.queues.iter().all(|q| q.is_empty()));

        // Position 1 is re-dispatched but sink 0 already holds it.
        state = step(&model, &state, CheckpointAction::Dispatch);
        state = step(&model, &state, CheckpointAction::Process { sink: 0 });
        assert!(state.staged[0].is_empty());
        assert_eq!(state.durable[0], vec![1]);
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_checkpoint -- --ignored --nocapture
    fn stateright_checkpoint_model_check() {
        use ::stateright::Checker;

        let model = CheckpointModel::new();
        let checker = model.checker().spawn_bfs().join();

        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
        println!("Model check passed! All checkpoint invariants hold.");
    }
}
