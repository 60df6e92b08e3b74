//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use once_cell::sync::Lazy;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use orecstm::prelude::*;
pub use orecstm::{
    ExponentialBackoffPolicy, GlobalConflictCounter, StmConfig, TransactionMetrics, TxnStatus,
};

// ============================================================================
// Initialization
// ============================================================================

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
});

/// Route `tracing` output through the test harness (once per process)
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

// ============================================================================
// Runtimes and configurations
// ============================================================================

/// Runtime with the default configuration and test logging
pub fn test_stm() -> Stm {
    init_tracing();
    Stm::new()
}

/// Runtime whose default family uses `config`
pub fn stm_with(config: TxnConfig) -> Stm {
    init_tracing();
    Stm::with_default_config(config).expect("test config must validate")
}

/// Fat, non-speculative configuration for tests that drive transactions by
/// hand and open more than one cell
pub fn fat_config() -> TxnConfig {
    TxnConfig::default().with_speculative(false)
}

/// Configuration that effectively never runs out of attempts
pub fn unbounded_config() -> TxnConfig {
    TxnConfig::default().with_max_retries(u32::MAX)
}

// ============================================================================
// Threads
// ============================================================================

/// Spawn `threads` workers that start together
///
/// Each worker receives its index; results are returned in index order.
pub fn run_concurrent<F, T>(threads: usize, work: F) -> Vec<T>
where
    F: Fn(usize) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let barrier = Arc::new(Barrier::new(threads));
    let work = Arc::new(work);
    let handles: Vec<JoinHandle<T>> = (0..threads)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            thread::spawn(move || {
                barrier.wait();
                work(i)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
