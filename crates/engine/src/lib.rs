//! Runtime layer for orecstm
//!
//! This crate drives transactions on top of the concurrency layer:
//! - Stm: runtime owning the conflict counter and per-family executors
//! - TxnExecutor: attempt loop (commit, blocking retry, backoff, speculative upgrade)
//! - TransactionPool: thread-local reuse of transaction objects
//! - StmConfig: TOML configuration with named transaction families
//!
//! The engine is the only component that knows about families, runtimes
//! and the retry loop; the concurrency layer only knows single attempts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod stm;

pub use config::{StmConfig, CONFIG_FILE_NAME};
pub use executor::{retry, TxnExecutor, TxnOutcome};
pub use metrics::TransactionMetrics;
pub use pool::{TransactionPool, MAX_POOL_SIZE};
pub use stm::Stm;
