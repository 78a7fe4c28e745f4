//! Retry delay computation.
//!
//! `delay = min(base * 2^(attempt - 1), max)`, then jittered by a uniform
//! factor in `[-12.5%, +12.5%]`.

use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// Exponential backoff with a cap and symmetric jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.backoff_base_ms, config.backoff_max_ms)
    }

    /// Capped delay before jitter; `attempt_count` is the count after the failure
    pub fn delay_for(&self, attempt_count: u32) -> u64 {
        let exponent = attempt_count.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Jittered delay for a given sample in `[0, 1)`
    pub fn jittered(&self, attempt_count: u32, sample: f64) -> u64 {
        let delay = self.delay_for(attempt_count) as f64;
        let actual = delay + delay * 0.25 * (sample - 0.5);
        actual.max(0.0).round() as u64
    }

    /// Jittered delay using the thread RNG
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        Duration::from_millis(self.jittered(attempt_count, sample))
    }
}
