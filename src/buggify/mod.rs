//! BUGGIFY - deterministic fault injection for simulation runs.
//!
//! Simulation wrappers around the source log, sink destinations and object
//! store ask here whether a fault should fire. Decisions draw from a
//! caller-supplied [`Rng`] so a failing simulation replays exactly from its
//! seed.
//!
//! ```ignore
//! if buggify!(&mut rng, faults::sink::WRITE_FAIL) {
//!     return Err(IoError::new(ErrorKind::Other, "injected"));
//! }
//! ```
//!
//! Named checks use the probability table of the installed
//! [`FaultConfig`]; the default table is empty, so they stay silent until a
//! profile such as [`FaultConfig::moderate`] is installed. Checks with an
//! explicit probability fire whenever the config is enabled.
//!
//! [`Rng`]: crate::io::Rng

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use crate::io::Rng;
use std::cell::RefCell;

thread_local! {
    static FAULT_CONFIG: RefCell<FaultConfig> = RefCell::new(FaultConfig::default());
}

/// Install a fault configuration for the current thread.
pub fn set_config(config: FaultConfig) {
    FAULT_CONFIG.with(|c| *c.borrow_mut() = config);
}

fn roll<R: Rng>(rng: &mut R, probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    let value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
    value < probability.min(1.0)
}

/// Check a fault at its configured probability.
#[inline]
pub fn should_buggify<R: Rng>(rng: &mut R, fault_id: &str) -> bool {
    let probability = FAULT_CONFIG.with(|c| c.borrow().get(fault_id));
    roll(rng, probability)
}

/// Check a fault with an explicit probability. Still honours `enabled`.
#[inline]
pub fn should_buggify_with_prob<R: Rng>(rng: &mut R, fault_id: &str, probability: f64) -> bool {
    let enabled = FAULT_CONFIG.with(|c| c.borrow().enabled);
    let fired = enabled && roll(rng, probability);
    if fired {
        tracing::trace!(fault = fault_id, "Injected fault");
    }
    fired
}

#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::should_buggify($rng, $fault_id)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}
