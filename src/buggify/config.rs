//! Fault probability tables.

use super::faults;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    /// Scales every configured probability.
    pub global_multiplier: f64,
    probabilities: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultConfig {
    /// Enabled with no per-fault probabilities. Only explicit-probability
    /// checks can fire.
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            global_multiplier: 1.0,
            probabilities: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            global_multiplier: 0.0,
            probabilities: HashMap::new(),
        }
    }

    /// Roughly 1% on every fault site.
    pub fn moderate() -> Self {
        let mut config = Self::new();
        for id in faults::ALL_FAULTS {
            config.probabilities.insert((*id).to_string(), 0.01);
        }
        config
    }

    /// Aggressive rates for stress runs.
    pub fn chaos() -> Self {
        let mut config = Self::new();
        config.set(faults::source::DISCONNECT, 0.05);
        config.set(faults::source::QUERY_FAIL, 0.05);
        config.set(faults::sink::WRITE_FAIL, 0.10);
        config.set(faults::sink::WRITE_TIMEOUT, 0.05);
        config.set(faults::sink::FLUSH_FAIL, 0.05);
        config.set(faults::store::PUT_FAIL, 0.05);
        config.set(faults::store::GET_FAIL, 0.05);
        config.set(faults::store::TIMEOUT, 0.02);
        config.set(faults::store::RENAME_FAIL, 0.05);
        config
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.global_multiplier = multiplier;
        self
    }

    pub fn set(&mut self, fault_id: &str, probability: f64) {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
    }

    /// Effective probability for a fault, zero when disabled.
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let base = self.probabilities.get(fault_id).copied().unwrap_or(0.0);
        (base * self.global_multiplier).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_returns_zero() {
        let config = FaultConfig::disabled();
        assert_eq!(config.get(faults::sink::WRITE_FAIL), 0.0);
    }

    #[test]
    fn test_multiplier_scales_and_clamps() {
        let config = FaultConfig::chaos().with_multiplier(20.0);
        assert_eq!(config.get(faults::sink::WRITE_FAIL), 1.0);
        let half = FaultConfig::moderate().with_multiplier(0.5);
        assert!((half.get(faults::store::PUT_FAIL) - 0.005).abs() < 1e-9);
    }
}
