//! orecstm - ownership-record based software transactional memory
//!
//! Shared state lives in transactional cells ([`TxnRef`]). Closures run as
//! transactions that either commit all their writes at once or none at all;
//! conflicting attempts are retried, and a transaction can block until one
//! of the cells it read changes.
//!
//! # Quick Start
//!
//! ```ignore
//! use orecstm::prelude::*;
//!
//! let stm = Stm::new();
//! let from = TxnRef::new(100i64);
//! let to = TxnRef::new(0i64);
//!
//! stm.atomic(|tx| {
//!     let amount = from.get(tx)?;
//!     from.set(tx, 0)?;
//!     to.alter(tx, |v| v + amount)?;
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `orecstm-core`: errors, configuration, shared enums
//! - `orecstm-concurrency`: orecs, cells, shadow records, the commit protocol
//! - `orecstm-engine`: runtime, retry loop, transaction pooling
//!
//! This crate re-exports the public surface of all three.

pub use orecstm_concurrency::{
    BackoffPolicy, CheapLatch, ExponentialBackoffPolicy, GlobalConflictCounter, InterruptHandle,
    LatchError, OrecState, RetryLatch, SpeculativeConfig, StandardLatch, Tranlocal, Transaction,
    TxnRef, TxnStatus, TxnValue, READ_BIASED_THRESHOLD,
};
pub use orecstm_core::{
    BackoffConfig, CellId, ConflictKind, LockMode, PessimisticLockLevel, SpeculativeReason,
    StmError, StmResult, TxnConfig,
};
pub use orecstm_engine::{
    retry, Stm, StmConfig, TransactionMetrics, TransactionPool, TxnExecutor, TxnOutcome,
    CONFIG_FILE_NAME,
};

/// The types most programs need
pub mod prelude {
    pub use crate::{
        retry, LockMode, PessimisticLockLevel, Stm, StmError, StmResult, Transaction, TxnConfig,
        TxnExecutor, TxnRef,
    };
}
