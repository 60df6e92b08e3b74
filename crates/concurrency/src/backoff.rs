//! Backoff between conflicting attempts
//!
//! Exponential growth from `min_delay_ns`, capped at `max_delay_ns`, with
//! full jitter so that transactions that collided once do not collide again
//! in lockstep.

use orecstm_core::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// How long to wait before the next attempt
pub trait BackoffPolicy: Send + Sync {
    /// Delay before attempt `attempt + 1`
    fn delay(&self, attempt: u32) -> Duration;

    /// Sleep (or yield) for the delay
    fn backoff(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if delay < Duration::from_micros(50) {
            std::thread::yield_now();
        } else {
            std::thread::sleep(delay);
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    min_delay_ns: u64,
    max_delay_ns: u64,
}

impl ExponentialBackoffPolicy {
    /// Policy with explicit bounds
    pub fn new(min_delay_ns: u64, max_delay_ns: u64) -> Self {
        ExponentialBackoffPolicy {
            min_delay_ns,
            max_delay_ns: max_delay_ns.max(min_delay_ns),
        }
    }

    /// Upper bound of the delay for `attempt`, before jitter
    pub fn ceiling(&self, attempt: u32) -> u64 {
        // Cap the shift to prevent overflow
        let shift = attempt.saturating_sub(1).min(63);
        let multiplier = 1u64 << shift;
        self.min_delay_ns
            .saturating_mul(multiplier)
            .min(self.max_delay_ns)
    }
}

impl From<&BackoffConfig> for ExponentialBackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(config.min_delay_ns, config.max_delay_ns)
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling <= self.min_delay_ns {
            return Duration::from_nanos(ceiling);
        }
        let ns = rand::thread_rng().gen_range(self.min_delay_ns..=ceiling);
        Duration::from_nanos(ns)
    }
}
