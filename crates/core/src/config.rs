//! Transaction configuration
//!
//! `TxnConfig` carries every option a transaction consults. It can be built
//! in code with the `with_*` methods or loaded from a TOML file:
//!
//! ```toml
//! family_name = "transfer"
//! max_retries = 1000
//! # timeout_ns = 5000000000
//! write_skew_allowed = false
//! pessimistic_lock_level = "lock_writes"
//!
//! [backoff]
//! min_delay_ns = 100
//! max_delay_ns = 10000000
//! ```
//!
//! Options the core does not interpret itself (the family name, the backoff
//! window) are threaded through unchanged to the driving loop.

use crate::error::{StmError, StmResult};
use crate::types::{LockMode, PessimisticLockLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Exponential backoff window applied between conflicting attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Smallest delay in nanoseconds
    pub min_delay_ns: u64,
    /// Largest delay in nanoseconds
    pub max_delay_ns: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ns: 100,
            max_delay_ns: 10_000_000,
        }
    }
}

/// Configuration for a family of transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Name used in log events and terminal errors
    pub family_name: String,
    /// Attempts allowed before `TooManyRetries`
    pub max_retries: u32,
    /// Budget for blocking retries, carried across attempts (`None` = wait forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ns: Option<u64>,
    /// Backoff between conflicting attempts
    pub backoff: BackoffConfig,
    /// Spin budget for a single orec operation
    pub spin_count: u32,
    /// Keep plain reads for commit validation and blocking retry
    pub read_tracking: bool,
    /// Skip publishing writes whose value equals the value read
    pub dirty_check: bool,
    /// Locks taken eagerly at open time
    pub pessimistic_lock_level: PessimisticLockLevel,
    /// Allow the write-skew anomaly (snapshot isolation)
    pub write_skew_allowed: bool,
    /// Blocking retry can be interrupted
    pub interruptible: bool,
    /// Reject writes
    pub readonly: bool,
    /// Start with a lean transaction and upgrade on demand
    pub speculative: bool,
    /// Cells a lean transaction may hold
    pub lean_capacity: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            family_name: "anonymous".to_string(),
            max_retries: 1000,
            timeout_ns: None,
            backoff: BackoffConfig::default(),
            spin_count: 64,
            read_tracking: true,
            dirty_check: true,
            pessimistic_lock_level: PessimisticLockLevel::None,
            write_skew_allowed: true,
            interruptible: false,
            readonly: false,
            speculative: true,
            lean_capacity: 1,
        }
    }
}

impl TxnConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the family name
    pub fn with_family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = name.into();
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the blocking-retry timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ns = Some(timeout.as_nanos().min(u64::MAX as u128) as u64);
        self
    }

    /// Wait forever in blocking retries
    pub fn without_timeout(mut self) -> Self {
        self.timeout_ns = None;
        self
    }

    /// Set the backoff window
    pub fn with_backoff(mut self, min_delay_ns: u64, max_delay_ns: u64) -> Self {
        self.backoff = BackoffConfig {
            min_delay_ns,
            max_delay_ns,
        };
        self
    }

    /// Set the orec spin budget
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Enable or disable read tracking
    pub fn with_read_tracking(mut self, enabled: bool) -> Self {
        self.read_tracking = enabled;
        self
    }

    /// Enable or disable the dirty check
    pub fn with_dirty_check(mut self, enabled: bool) -> Self {
        self.dirty_check = enabled;
        self
    }

    /// Set the pessimistic lock level
    pub fn with_pessimistic_lock_level(mut self, level: PessimisticLockLevel) -> Self {
        self.pessimistic_lock_level = level;
        self
    }

    /// Allow or forbid write skew
    pub fn with_write_skew_allowed(mut self, allowed: bool) -> Self {
        self.write_skew_allowed = allowed;
        self
    }

    /// Make blocking retries interruptible
    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    /// Make the transaction readonly
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Enable or disable speculative (lean-first) execution
    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    /// Set the lean transaction capacity
    pub fn with_lean_capacity(mut self, capacity: usize) -> Self {
        self.lean_capacity = capacity;
        self
    }

    /// Lock mode taken when a cell is opened for read
    pub fn read_lock_mode(&self) -> LockMode {
        self.pessimistic_lock_level.read_lock_mode()
    }

    /// Lock mode taken when a cell is opened for write
    pub fn write_lock_mode(&self) -> LockMode {
        self.pessimistic_lock_level.write_lock_mode()
    }

    /// Lock mode dirty writes are locked with during commit validation
    ///
    /// `Exclusive` makes in-flight committers visible to each other's read
    /// validation, which is what rules out write skew.
    pub fn commit_lock_mode(&self) -> LockMode {
        if self.write_skew_allowed {
            LockMode::Write
        } else {
            LockMode::Exclusive
        }
    }

    /// Check option consistency
    pub fn validate(&self) -> StmResult<()> {
        if self.max_retries == 0 {
            return Err(StmError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.backoff.min_delay_ns > self.backoff.max_delay_ns {
            return Err(StmError::InvalidConfig(format!(
                "backoff min_delay_ns ({}) exceeds max_delay_ns ({})",
                self.backoff.min_delay_ns, self.backoff.max_delay_ns
            )));
        }
        if self.speculative && self.lean_capacity == 0 {
            return Err(StmError::InvalidConfig(
                "lean_capacity must be at least 1 when speculative".to_string(),
            ));
        }
        if self.readonly && self.write_lock_mode() > self.read_lock_mode() {
            return Err(StmError::InvalidConfig(format!(
                "readonly transactions cannot use pessimistic level {:?}",
                self.pessimistic_lock_level
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> StmResult<Self> {
        let config: TxnConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file(path: &Path) -> StmResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Transaction configuration
#
# Name reported in logs and terminal errors
family_name = "anonymous"

# Attempts before giving up with TooManyRetries
max_retries = 1000

# Blocking-retry budget in nanoseconds, shared by all attempts.
# Omit to wait forever.
# timeout_ns = 5000000000

# Orec spin budget per lock/arrive operation
spin_count = 64

# Keep plain reads for commit validation and blocking retry
read_tracking = true

# Do not publish writes that leave the value unchanged
dirty_check = true

# "none", "lock_writes", "lock_reads_and_writes",
# "privatize_writes" or "privatize_reads_and_writes"
pessimistic_lock_level = "none"

# true = snapshot isolation, false = serializable
write_skew_allowed = true

interruptible = false
readonly = false

# Start lean and upgrade when the transaction outgrows it
speculative = true
lean_capacity = 1

[backoff]
min_delay_ns = 100
max_delay_ns = 10000000
"#
    }
}
