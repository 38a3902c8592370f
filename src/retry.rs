//! Exponential backoff with jitter.

use crate::io::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry schedule shared by source reconnects and sink writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "crate::pipeline::config::duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "crate::pipeline::config::duration_millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Attempts before giving up. Zero retries forever.
    pub max_attempts: u32,
    /// Fraction of the delay added as random jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Fast schedule for tests: millisecond delays, no jitter.
    pub fn test() -> Self {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Whether attempt number `attempt` (1-based, counting failures) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Delay before retry `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as f64 * jitter) as u64;
        base + Duration::from_millis(rng.gen_range(0, spread + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(500));
        assert_eq!(policy.base_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        let mut rng = SimulatedRng::new(3);
        for attempt in 1..6 {
            let base = policy.base_delay(attempt);
            let d = policy.delay(attempt, &mut rng);
            assert!(d >= base && d <= base + base / 2 + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_allows() {
        let policy = RetryPolicy::test().with_max_attempts(3);
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(RetryPolicy::test().with_max_attempts(0).allows(1_000));
    }
}
