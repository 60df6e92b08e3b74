//! Learned lean/fat choice per transaction family
//!
//! A family starts out running lean transactions: a fixed, tiny record
//! capacity and no commute or eager-lock support. The first time a lean
//! attempt needs more, it fails with a speculative failure, the family is
//! marked fat, and every later transaction of that family starts fat.
//! The flag only ever moves from lean to fat.

use orecstm_core::{SpeculativeReason, TxnConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared lean/fat state of one transaction family
#[derive(Debug)]
pub struct SpeculativeConfig {
    enabled: bool,
    lean_capacity: usize,
    fat: AtomicBool,
    failures: AtomicU64,
}

impl SpeculativeConfig {
    /// Fresh state derived from the family's configuration
    pub fn new(config: &TxnConfig) -> Self {
        SpeculativeConfig {
            enabled: config.speculative,
            lean_capacity: config.lean_capacity,
            fat: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Start transactions lean?
    pub fn start_lean(&self) -> bool {
        self.enabled && !self.fat.load(Ordering::Acquire)
    }

    /// Records a lean transaction may hold
    pub fn lean_capacity(&self) -> usize {
        self.lean_capacity
    }

    /// Has the family been promoted to fat?
    pub fn is_fat(&self) -> bool {
        self.fat.load(Ordering::Acquire)
    }

    /// A lean attempt ran out of room; start fat from now on
    pub fn signal_failure(&self, reason: SpeculativeReason) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if !self.fat.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "orecstm::speculative", %reason, "family promoted to fat transactions");
        }
    }

    /// Speculative failures seen so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
