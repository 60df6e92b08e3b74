//! Retry latches
//!
//! A latch is the gate a blocking retry waits on. It is registered on the
//! listener chain of every cell the transaction read, and whichever commit
//! touches one of those cells first opens it.
//!
//! Latches are reused across retries. Every `reset` moves the latch into a
//! new era; registrations carry the era they were made in, and an `open`
//! for an older era is ignored. That keeps a stale listener node from an
//! earlier attempt from waking the current wait.
//!
//! Two implementations share the [`RetryLatch`] contract:
//! - [`CheapLatch`]: an atomic state word plus thread parking. No timeouts.
//! - [`StandardLatch`]: mutex and condition variable, supports timed waits.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a wait ended without the latch opening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LatchError {
    /// The waiter was interrupted
    #[error("latch wait interrupted")]
    Interrupted,
    /// The timeout elapsed first
    #[error("latch wait timed out")]
    TimedOut,
    /// This latch cannot wait with a timeout
    #[error("latch does not support timed waits")]
    TimeoutUnsupported,
}

/// One-shot, era-guarded, wakeable gate
pub trait RetryLatch: Send + Sync {
    /// Current era
    fn era(&self) -> u64;

    /// Is the latch open in its current era?
    fn is_open(&self) -> bool;

    /// Open the latch if it is still in `expected_era`
    fn open(&self, expected_era: u64);

    /// Close the latch and move to the next era, which is returned
    ///
    /// A pending interrupt survives the reset.
    fn reset(&self) -> u64;

    /// Wake an interruptible waiter with [`LatchError::Interrupted`]
    ///
    /// If nobody is waiting, the next interruptible wait consumes it.
    fn interrupt(&self);

    /// Block until open (or the era moves on); interruptible
    fn await_open(&self, expected_era: u64) -> Result<(), LatchError>;

    /// Block until open (or the era moves on); ignores interrupts
    fn await_uninterruptible(&self, expected_era: u64);

    /// Block for at most `timeout_ns`; interruptible
    ///
    /// Returns the nanoseconds left when the latch opened.
    fn try_await_ns(&self, expected_era: u64, timeout_ns: u64) -> Result<u64, LatchError>;

    /// Block for at most `timeout_ns`; ignores interrupts
    fn try_await_ns_uninterruptible(
        &self,
        expected_era: u64,
        timeout_ns: u64,
    ) -> Result<u64, LatchError>;

    /// Does `try_await_ns` work on this latch?
    fn supports_timeout(&self) -> bool;
}

// ============================================================================
// CheapLatch
// ============================================================================

const OPEN_BIT: u64 = 1;

/// Latch built on an atomic word and `thread::park`
///
/// Meant for the common unbounded wait with a single waiter.
pub struct CheapLatch {
    // era << 1 | open
    state: AtomicU64,
    interrupted: AtomicBool,
    waiter: Mutex<Option<Thread>>,
}

impl CheapLatch {
    /// A closed latch in era 0
    pub fn new() -> Self {
        CheapLatch {
            state: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            waiter: Mutex::new(None),
        }
    }

    fn passable(&self, expected_era: u64) -> bool {
        let s = self.state.load(Ordering::Acquire);
        s >> 1 != expected_era || s & OPEN_BIT != 0
    }

    fn wait(&self, expected_era: u64, interruptible: bool) -> Result<(), LatchError> {
        *self.waiter.lock() = Some(thread::current());
        let result = loop {
            if self.passable(expected_era) {
                break Ok(());
            }
            if interruptible && self.interrupted.swap(false, Ordering::AcqRel) {
                break Err(LatchError::Interrupted);
            }
            thread::park();
        };
        *self.waiter.lock() = None;
        result
    }
}

impl Default for CheapLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryLatch for CheapLatch {
    fn era(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 1
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPEN_BIT != 0
    }

    fn open(&self, expected_era: u64) {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s >> 1 != expected_era || s & OPEN_BIT != 0 {
                return;
            }
            if self
                .state
                .compare_exchange(s, s | OPEN_BIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if let Some(waiter) = self.waiter.lock().as_ref() {
            waiter.unpark();
        }
    }

    fn reset(&self) -> u64 {
        let era = (self.state.load(Ordering::Acquire) >> 1) + 1;
        self.state.store(era << 1, Ordering::Release);
        era
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        if let Some(waiter) = self.waiter.lock().as_ref() {
            waiter.unpark();
        }
    }

    fn await_open(&self, expected_era: u64) -> Result<(), LatchError> {
        self.wait(expected_era, true)
    }

    fn await_uninterruptible(&self, expected_era: u64) {
        let _ = self.wait(expected_era, false);
    }

    fn try_await_ns(&self, _expected_era: u64, _timeout_ns: u64) -> Result<u64, LatchError> {
        Err(LatchError::TimeoutUnsupported)
    }

    fn try_await_ns_uninterruptible(
        &self,
        _expected_era: u64,
        _timeout_ns: u64,
    ) -> Result<u64, LatchError> {
        Err(LatchError::TimeoutUnsupported)
    }

    fn supports_timeout(&self) -> bool {
        false
    }
}

// ============================================================================
// StandardLatch
// ============================================================================

#[derive(Debug, Default)]
struct LatchState {
    era: u64,
    open: bool,
    interrupted: bool,
}

/// Latch built on a mutex and condition variable; supports timed waits
pub struct StandardLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl StandardLatch {
    /// A closed latch in era 0
    pub fn new() -> Self {
        StandardLatch {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
        }
    }

    fn timed_wait(
        &self,
        expected_era: u64,
        timeout_ns: u64,
        interruptible: bool,
    ) -> Result<u64, LatchError> {
        let start = Instant::now();
        let deadline = start + Duration::from_nanos(timeout_ns);
        let mut state = self.state.lock();
        loop {
            if state.era != expected_era || state.open {
                let spent = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
                return Ok(timeout_ns.saturating_sub(spent));
            }
            if interruptible && state.interrupted {
                state.interrupted = false;
                return Err(LatchError::Interrupted);
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.era != expected_era || state.open {
                    return Ok(0);
                }
                return Err(LatchError::TimedOut);
            }
        }
    }
}

impl Default for StandardLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryLatch for StandardLatch {
    fn era(&self) -> u64 {
        self.state.lock().era
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn open(&self, expected_era: u64) {
        let mut state = self.state.lock();
        if state.era == expected_era && !state.open {
            state.open = true;
            self.cond.notify_all();
        }
    }

    fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.era += 1;
        state.open = false;
        state.era
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    fn await_open(&self, expected_era: u64) -> Result<(), LatchError> {
        let mut state = self.state.lock();
        loop {
            if state.era != expected_era || state.open {
                return Ok(());
            }
            if state.interrupted {
                state.interrupted = false;
                return Err(LatchError::Interrupted);
            }
            self.cond.wait(&mut state);
        }
    }

    fn await_uninterruptible(&self, expected_era: u64) {
        let mut state = self.state.lock();
        while state.era == expected_era && !state.open {
            self.cond.wait(&mut state);
        }
    }

    fn try_await_ns(&self, expected_era: u64, timeout_ns: u64) -> Result<u64, LatchError> {
        self.timed_wait(expected_era, timeout_ns, true)
    }

    fn try_await_ns_uninterruptible(
        &self,
        expected_era: u64,
        timeout_ns: u64,
    ) -> Result<u64, LatchError> {
        self.timed_wait(expected_era, timeout_ns, false)
    }

    fn supports_timeout(&self) -> bool {
        true
    }
}
