//! Error types for the STM engine
//!
//! This module defines every error a transaction can report. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into three groups:
//! - **Conflicts** (`ReadConflict`, `WriteConflict`, `Locked`): recoverable,
//!   the driving loop aborts the attempt, backs off and runs it again.
//! - **Control flow** (`RetryRequested`, `SpeculativeFailure`): not failures,
//!   they tell the driving loop to block or to rebuild a larger transaction.
//! - **Terminal** (everything else): surfaced to the caller.
//!
//! Broken orec invariants (departing without arriving, unlocking a lock that
//! is not held) are not errors at all. They panic.

use crate::types::{CellId, SpeculativeReason};
use std::io;
use thiserror::Error;

/// Result type alias for STM operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Kind of conflict that aborted an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// A cell that was read changed (or is being published) before commit
    Read,
    /// A cell that was written changed before its commit lock was acquired
    Write,
    /// A lock could not be acquired within the spin budget
    Locked,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::Read => write!(f, "read"),
            ConflictKind::Write => write!(f, "write"),
            ConflictKind::Locked => write!(f, "locked"),
        }
    }
}

/// Error types for the STM engine
#[derive(Debug, Error)]
pub enum StmError {
    /// A read cell changed since it was opened
    #[error("read conflict on cell {cell}")]
    ReadConflict {
        /// Cell whose version moved
        cell: CellId,
    },

    /// A written cell changed before the commit lock was acquired
    #[error("write conflict on cell {cell}")]
    WriteConflict {
        /// Cell whose version moved
        cell: CellId,
    },

    /// A lock could not be acquired within the spin budget
    #[error("cell {cell} is locked")]
    Locked {
        /// Cell that stayed locked
        cell: CellId,
    },

    /// User code asked to block until one of the read cells changes
    #[error("retry requested")]
    RetryRequested,

    /// A lean transaction needed more than it was built for
    #[error("speculative configuration failure: {reason}")]
    SpeculativeFailure {
        /// What the lean transaction could not do
        reason: SpeculativeReason,
    },

    /// All attempts were used up
    #[error("transaction '{family}' failed after {attempts} attempts")]
    TooManyRetries {
        /// Transaction family name
        family: String,
        /// Attempts made
        attempts: u32,
    },

    /// A blocking retry outlived the remaining timeout
    #[error("transaction '{family}' timed out waiting for a retry wake-up")]
    RetryTimeout {
        /// Transaction family name
        family: String,
    },

    /// A blocking retry was interrupted
    #[error("transaction '{family}' was interrupted while waiting")]
    Interrupted {
        /// Transaction family name
        family: String,
    },

    /// Retry was requested but there is nothing to wait on
    #[error("transaction '{family}' cannot block: no tracked reads")]
    NoRetryPossible {
        /// Transaction family name
        family: String,
    },

    /// A readonly transaction tried to write
    #[error("readonly transaction cannot write cell {cell}")]
    ReadonlyViolation {
        /// Cell that was opened for write
        cell: CellId,
    },

    /// Operation on a transaction that already committed or aborted
    #[error("cannot {operation}: transaction is {status}")]
    DeadTransaction {
        /// Operation that was attempted
        operation: &'static str,
        /// Status the transaction was in
        status: String,
    },

    /// Operation not valid in the current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error while loading a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<toml::de::Error> for StmError {
    fn from(e: toml::de::Error) -> Self {
        StmError::InvalidConfig(e.to_string())
    }
}

impl StmError {
    /// Build the conflict error for `kind` on `cell`
    pub fn conflict(kind: ConflictKind, cell: CellId) -> Self {
        match kind {
            ConflictKind::Read => StmError::ReadConflict { cell },
            ConflictKind::Write => StmError::WriteConflict { cell },
            ConflictKind::Locked => StmError::Locked { cell },
        }
    }

    /// Conflict kind, if this is a conflict
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StmError::ReadConflict { .. } => Some(ConflictKind::Read),
            StmError::WriteConflict { .. } => Some(ConflictKind::Write),
            StmError::Locked { .. } => Some(ConflictKind::Locked),
            _ => None,
        }
    }

    /// True for read/write conflicts and lock timeouts
    pub fn is_conflict(&self) -> bool {
        self.conflict_kind().is_some()
    }

    /// True if the driving loop can handle this without involving the caller
    pub fn is_recoverable(&self) -> bool {
        self.is_conflict()
            || matches!(
                self,
                StmError::RetryRequested | StmError::SpeculativeFailure { .. }
            )
    }
}
