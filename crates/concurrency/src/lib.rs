//! Concurrency layer for orecstm
//!
//! This crate implements the ownership-record STM core:
//! - Orec: packed per-cell lock/arrival word with read biasing
//! - TxnRef / Tranlocal: transactional cells and their shadow records
//! - Transaction: prepare/commit/abort/retry over a set of records
//! - Retry latches and per-cell listener chains for blocking retries
//! - Global conflict counter for read consistency during execution
//! - Speculative lean/fat configuration and backoff policies

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod cell;
pub mod conflict;
pub mod instrumentation;
pub mod latch;
pub mod listeners;
pub mod orec;
pub mod speculative;
pub mod tranlocal;
pub mod transaction;

pub use backoff::{BackoffPolicy, ExponentialBackoffPolicy};
pub use cell::{CellCore, TxnRef, TxnValue, ATOMIC_GET_SPIN};
pub use conflict::{GlobalConflictCounter, LocalConflictCounter};
pub use instrumentation::OrecStats;
pub use latch::{CheapLatch, LatchError, RetryLatch, StandardLatch};
pub use listeners::{DetachedListeners, ListenerChain, ListenerRegistration};
pub use orec::{ArriveStatus, Orec, OrecState, READ_BIASED_THRESHOLD};
pub use speculative::SpeculativeConfig;
pub use tranlocal::{AccessMode, Tranlocal, TranlocalMeta};
pub use transaction::{InterruptHandle, Transaction, TxnStatus};
