//! Concurrency Integration Tests
//!
//! End-to-end tests of the STM runtime: atomicity, isolation, blocking
//! retry, contention and the transaction lifecycle.

#[path = "../common/mod.rs"]
mod common;

mod atomicity;
mod isolation;
mod retry_wakeup;
mod stress;
mod transaction_lifecycle;
