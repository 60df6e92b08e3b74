//! Shared types used across the STM crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a transactional cell
///
/// Ids are handed out from a global counter and never reused, so they are
/// safe map keys for a transaction's opened records and stable in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        CellId(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id (tests and diagnostics)
    pub fn from_raw(raw: u64) -> Self {
        CellId(raw)
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lock mode held on (or requested from) a cell's orec
///
/// Modes are ordered by strength: a transaction holding a mode also has
/// every weaker guarantee.
///
/// - `Read`: shared; blocks writers from locking, readers may still arrive.
/// - `Write`: single holder; blocks other lockers, readers may still arrive.
/// - `Exclusive`: single holder; blocks every arrival. Held while publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No lock
    #[default]
    None,
    /// Shared read lock
    Read,
    /// Write lock
    Write,
    /// Exclusive (commit) lock
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Exclusive => "exclusive",
        };
        f.write_str(s)
    }
}

/// Locks a transaction takes eagerly when it opens cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PessimisticLockLevel {
    /// Fully optimistic, locks only at commit
    #[default]
    None,
    /// Write-lock cells when they are opened for write
    LockWrites,
    /// Read-lock reads and write-lock writes
    LockReadsAndWrites,
    /// Exclusively lock cells opened for write
    PrivatizeWrites,
    /// Exclusively lock every opened cell
    PrivatizeReadsAndWrites,
}

impl PessimisticLockLevel {
    /// Lock mode applied when a cell is opened for read
    pub fn read_lock_mode(&self) -> LockMode {
        match self {
            PessimisticLockLevel::None
            | PessimisticLockLevel::LockWrites
            | PessimisticLockLevel::PrivatizeWrites => LockMode::None,
            PessimisticLockLevel::LockReadsAndWrites => LockMode::Read,
            PessimisticLockLevel::PrivatizeReadsAndWrites => LockMode::Exclusive,
        }
    }

    /// Lock mode applied when a cell is opened for write
    pub fn write_lock_mode(&self) -> LockMode {
        match self {
            PessimisticLockLevel::None => LockMode::None,
            PessimisticLockLevel::LockWrites | PessimisticLockLevel::LockReadsAndWrites => {
                LockMode::Write
            }
            PessimisticLockLevel::PrivatizeWrites
            | PessimisticLockLevel::PrivatizeReadsAndWrites => LockMode::Exclusive,
        }
    }
}

/// Why a lean (speculative) transaction had to be rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculativeReason {
    /// More cells were opened than the lean transaction holds
    CapacityExceeded {
        /// Cells the lean transaction was built for
        capacity: usize,
    },
    /// Commuting functions need a fat transaction
    CommuteRequired,
    /// An eager lock was requested at open time
    EagerLockRequired,
}

impl fmt::Display for SpeculativeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeculativeReason::CapacityExceeded { capacity } => {
                write!(f, "more than {} cell(s) opened", capacity)
            }
            SpeculativeReason::CommuteRequired => write!(f, "commute requires a fat transaction"),
            SpeculativeReason::EagerLockRequired => {
                write!(f, "eager locking requires a fat transaction")
            }
        }
    }
}
