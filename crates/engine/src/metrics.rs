//! Execution metrics
//!
//! Counters are updated with `Relaxed` ordering. They are observational
//! only and never synchronize anything else.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by a runtime and its executors
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    started: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    blocking_retries: AtomicU64,
    speculative_upgrades: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocking_retry(&self) {
        self.blocking_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_speculative_upgrade(&self) {
        self.speculative_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransactionMetrics {
        let started = self.started.load(Ordering::Relaxed);
        let committed = self.committed.load(Ordering::Relaxed);
        TransactionMetrics {
            total_started: started,
            total_committed: committed,
            total_failed: self.failed.load(Ordering::Relaxed),
            total_conflicts: self.conflicts.load(Ordering::Relaxed),
            total_blocking_retries: self.blocking_retries.load(Ordering::Relaxed),
            total_speculative_upgrades: self.speculative_upgrades.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time execution statistics
///
/// One execution is one call to `TxnExecutor::execute`, however many
/// attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    /// Executions started
    pub total_started: u64,
    /// Executions that committed
    pub total_committed: u64,
    /// Executions that ended in an error
    pub total_failed: u64,
    /// Attempts aborted by a read, write or lock conflict
    pub total_conflicts: u64,
    /// Attempts that blocked in `retry`
    pub total_blocking_retries: u64,
    /// Lean attempts rebuilt as fat transactions
    pub total_speculative_upgrades: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Executions that finished either way
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_failed
    }

    /// Conflicting attempts per execution
    pub fn conflict_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_conflicts as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
