//! Wall-clock abstraction.
//!
//! Lease expiry, checkpoint stall detection and OLAP batch age all read time
//! through [`PipelineClock`], so simulation can jump past a lease TTL
//! without sleeping.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Milliseconds since the Unix epoch (or since simulation start).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

pub trait PipelineClock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }

    fn has_elapsed(&self, since: Timestamp, duration: Duration) -> bool {
        self.elapsed(since) >= duration
    }
}

/// Shared handle used throughout the pipeline.
pub type SharedClock = Arc<dyn PipelineClock>;

/// Real time, anchored once at construction and advanced by a monotonic
/// `Instant` so wall-clock steps cannot move it backwards.
#[derive(Clone)]
pub struct ProductionClock {
    start: Instant,
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl PipelineClock for ProductionClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.start_millis + self.start.elapsed().as_millis() as u64)
    }
}

/// Virtual time. Only moves when told to; clones share the same time.
#[derive(Clone, Debug)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.advance_ms(duration.as_millis() as u64);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

impl PipelineClock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.current_ms())
    }
}
