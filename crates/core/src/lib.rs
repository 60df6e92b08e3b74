//! Core types for orecstm
//!
//! This crate defines the pieces every other layer shares:
//! - Error taxonomy (StmError, ConflictKind)
//! - Transaction configuration (TxnConfig, loadable from TOML)
//! - Lock modes and pessimistic lock levels
//! - Cell identity

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackoffConfig, TxnConfig};
pub use error::{ConflictKind, StmError, StmResult};
pub use types::{CellId, LockMode, PessimisticLockLevel, SpeculativeReason};
