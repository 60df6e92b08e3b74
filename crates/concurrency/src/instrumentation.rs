//! CAS instrumentation for orecs
//!
//! Feature-gated to avoid overhead in production.
//! Enable with: cargo build --features perf-trace
//!
//! Unit tests always get the counting version, so read-bias behavior can be
//! asserted by watching how many CAS operations an `arrive` performs.
//!
//! # Usage
//!
//! ```ignore
//! let orec = Orec::new();
//! orec.arrive(0);
//! assert_eq!(orec.stats().cas_successes(), 1);
//! ```

#[cfg(any(test, feature = "perf-trace"))]
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-orec CAS counters
#[cfg(any(test, feature = "perf-trace"))]
#[derive(Debug, Default)]
pub struct OrecStats {
    cas_successes: AtomicU64,
    cas_failures: AtomicU64,
}

#[cfg(any(test, feature = "perf-trace"))]
impl OrecStats {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            cas_successes: AtomicU64::new(0),
            cas_failures: AtomicU64::new(0),
        }
    }

    /// Record the outcome of one CAS on the orec word
    #[inline]
    pub fn record_cas(&self, succeeded: bool) {
        if succeeded {
            self.cas_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cas_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// CAS operations that changed the word
    pub fn cas_successes(&self) -> u64 {
        self.cas_successes.load(Ordering::Relaxed)
    }

    /// CAS operations that lost a race
    pub fn cas_failures(&self) -> u64 {
        self.cas_failures.load(Ordering::Relaxed)
    }

    /// All CAS attempts
    pub fn cas_total(&self) -> u64 {
        self.cas_successes() + self.cas_failures()
    }

    /// Format as human-readable string
    pub fn summary(&self) -> String {
        format!(
            "cas: {} ok, {} failed",
            self.cas_successes(),
            self.cas_failures()
        )
    }
}

/// Zero-sized stand-in when instrumentation is compiled out
#[cfg(not(any(test, feature = "perf-trace")))]
#[derive(Debug, Default)]
pub struct OrecStats;

#[cfg(not(any(test, feature = "perf-trace")))]
impl OrecStats {
    /// Create the no-op counters
    pub const fn new() -> Self {
        OrecStats
    }

    /// No-op
    #[inline(always)]
    pub fn record_cas(&self, _succeeded: bool) {}
}
