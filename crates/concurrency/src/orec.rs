//! Ownership record (orec)
//!
//! Every transactional cell owns one orec: a single `AtomicU64` that packs
//! its lock state, the number of transactions depending on the current
//! version (the surplus), and the read-biasing heuristic.
//!
//! ```text
//!  63   62   61   60  59..52            51..32            31..0
//! +----+----+----+---+-----------------+-----------------+-----------------+
//! | X  | W  | RB | - | readonly streak | read lock count |     surplus     |
//! +----+----+----+---+-----------------+-----------------+-----------------+
//! ```
//!
//! All transitions follow the same shape: load the word, compute the next
//! word with the pure functions in [`word`], compare-and-swap, and retry on
//! a lost race. Lock contention consumes the caller's spin budget; a lost CAS
//! does not, since some other party made progress.
//!
//! # Invariants
//!
//! - exclusive lock ⇒ no write lock
//! - read locks held ⇒ no exclusive lock
//! - read biased ⇒ surplus ≤ 1
//!
//! Departing without having arrived, or unlocking a mode that is not held,
//! breaks the protocol and panics.
//!
//! # Read biasing
//!
//! Each read-only departure bumps the readonly streak. When the surplus
//! drops to zero with the streak at [`READ_BIASED_THRESHOLD`], the orec
//! flips to read biased: from then on the surplus is pinned at 1 and
//! arrivals skip the CAS entirely, returning [`ArriveStatus::Unregistered`]
//! so the reader knows not to depart. The first update departure clears the
//! flag and the streak.

use crate::instrumentation::OrecStats;
use orecstm_core::LockMode;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Consecutive read-only departures after which an orec becomes read biased
pub const READ_BIASED_THRESHOLD: u64 = 16;

/// Pure accessors and mutators on the packed orec word
pub mod word {
    use orecstm_core::LockMode;

    const SURPLUS_MASK: u64 = 0xFFFF_FFFF;
    const READ_LOCK_SHIFT: u32 = 32;
    const READ_LOCK_MASK: u64 = 0xF_FFFF << READ_LOCK_SHIFT;
    const STREAK_SHIFT: u32 = 52;
    const STREAK_MASK: u64 = 0xFF << STREAK_SHIFT;
    const READ_BIASED_BIT: u64 = 1 << 61;
    const WRITE_LOCK_BIT: u64 = 1 << 62;
    const EXCLUSIVE_LOCK_BIT: u64 = 1 << 63;

    /// Largest representable surplus
    pub const MAX_SURPLUS: u64 = SURPLUS_MASK;
    /// Largest representable read lock count
    pub const MAX_READ_LOCKS: u64 = READ_LOCK_MASK >> READ_LOCK_SHIFT;
    /// Largest representable readonly streak
    pub const MAX_STREAK: u64 = STREAK_MASK >> STREAK_SHIFT;

    #[inline]
    pub fn has_exclusive_lock(w: u64) -> bool {
        w & EXCLUSIVE_LOCK_BIT != 0
    }

    #[inline]
    pub fn has_write_lock(w: u64) -> bool {
        w & WRITE_LOCK_BIT != 0
    }

    #[inline]
    pub fn read_lock_count(w: u64) -> u64 {
        (w & READ_LOCK_MASK) >> READ_LOCK_SHIFT
    }

    #[inline]
    pub fn has_any_lock(w: u64) -> bool {
        has_exclusive_lock(w) || has_write_lock(w) || read_lock_count(w) > 0
    }

    #[inline]
    pub fn surplus(w: u64) -> u64 {
        w & SURPLUS_MASK
    }

    #[inline]
    pub fn is_read_biased(w: u64) -> bool {
        w & READ_BIASED_BIT != 0
    }

    #[inline]
    pub fn readonly_streak(w: u64) -> u64 {
        (w & STREAK_MASK) >> STREAK_SHIFT
    }

    #[inline]
    pub fn with_exclusive_lock(w: u64, locked: bool) -> u64 {
        if locked {
            w | EXCLUSIVE_LOCK_BIT
        } else {
            w & !EXCLUSIVE_LOCK_BIT
        }
    }

    #[inline]
    pub fn with_write_lock(w: u64, locked: bool) -> u64 {
        if locked {
            w | WRITE_LOCK_BIT
        } else {
            w & !WRITE_LOCK_BIT
        }
    }

    #[inline]
    pub fn with_read_lock_count(w: u64, count: u64) -> u64 {
        debug_assert!(count <= MAX_READ_LOCKS);
        (w & !READ_LOCK_MASK) | (count << READ_LOCK_SHIFT)
    }

    #[inline]
    pub fn with_surplus(w: u64, surplus: u64) -> u64 {
        debug_assert!(surplus <= MAX_SURPLUS);
        (w & !SURPLUS_MASK) | surplus
    }

    #[inline]
    pub fn with_read_biased(w: u64, biased: bool) -> u64 {
        if biased {
            w | READ_BIASED_BIT
        } else {
            w & !READ_BIASED_BIT
        }
    }

    #[inline]
    pub fn with_readonly_streak(w: u64, streak: u64) -> u64 {
        debug_assert!(streak <= MAX_STREAK);
        (w & !STREAK_MASK) | (streak << STREAK_SHIFT)
    }

    /// Can a party holding `held` move to `desired` given the word?
    ///
    /// Only meaningful for `desired > held`.
    pub fn lock_is_free(w: u64, held: LockMode, desired: LockMode) -> bool {
        if has_exclusive_lock(w) {
            return false;
        }
        if has_write_lock(w) && held != LockMode::Write {
            return false;
        }
        let own_reads = u64::from(held == LockMode::Read);
        match desired {
            LockMode::None | LockMode::Read => true,
            LockMode::Write | LockMode::Exclusive => read_lock_count(w) == own_reads,
        }
    }

    /// Human-readable rendering for panic messages
    pub fn describe(w: u64) -> String {
        format!(
            "orec[exclusive={}, write={}, read_locks={}, surplus={}, read_biased={}, readonly_streak={}]",
            has_exclusive_lock(w),
            has_write_lock(w),
            read_lock_count(w),
            surplus(w),
            is_read_biased(w),
            readonly_streak(w),
        )
    }
}

/// Outcome of an arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArriveStatus {
    /// Surplus was incremented; the caller must depart later
    Normal,
    /// Read-biased orec; nothing to depart
    Unregistered,
    /// The requested lock (or arrival past an exclusive lock) was not free
    LockNotFree,
}

/// Decoded view of an orec word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrecState {
    /// Exclusive lock bit
    pub exclusive_lock: bool,
    /// Write lock bit
    pub write_lock: bool,
    /// Number of read locks
    pub read_lock_count: u64,
    /// Transactions depending on the current version
    pub surplus: u64,
    /// Read-biased flag
    pub read_biased: bool,
    /// Consecutive read-only departures
    pub readonly_streak: u64,
}

impl From<u64> for OrecState {
    fn from(w: u64) -> Self {
        OrecState {
            exclusive_lock: word::has_exclusive_lock(w),
            write_lock: word::has_write_lock(w),
            read_lock_count: word::read_lock_count(w),
            surplus: word::surplus(w),
            read_biased: word::is_read_biased(w),
            readonly_streak: word::readonly_streak(w),
        }
    }
}

#[cold]
#[inline(never)]
fn protocol_violation(what: &str, w: u64) -> ! {
    panic!("orec protocol violation: {} ({})", what, word::describe(w))
}

#[inline]
pub(crate) fn spin_wait(remaining: u32) {
    if remaining % 32 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// Read-only departure: one less surplus, streak bump, maybe flip to read biased
fn readonly_departure(w: u64) -> u64 {
    let surplus = word::surplus(w) - 1;
    let mut streak = word::readonly_streak(w);
    if streak < READ_BIASED_THRESHOLD {
        streak += 1;
    }
    let mut next = word::with_surplus(w, surplus);
    if surplus == 0 && streak >= READ_BIASED_THRESHOLD {
        next = word::with_read_biased(next, true);
        streak = 0;
    }
    word::with_readonly_streak(next, streak)
}

/// Remove `held` from the word, panicking if it is not there
fn release_lock(w: u64, held: LockMode) -> u64 {
    match held {
        LockMode::None => protocol_violation("unlock without holding a lock", w),
        LockMode::Read => {
            let count = word::read_lock_count(w);
            if count == 0 {
                protocol_violation("read unlock without read locks", w);
            }
            word::with_read_lock_count(w, count - 1)
        }
        LockMode::Write => {
            if !word::has_write_lock(w) {
                protocol_violation("write unlock without write lock", w);
            }
            word::with_write_lock(w, false)
        }
        LockMode::Exclusive => {
            if !word::has_exclusive_lock(w) {
                protocol_violation("exclusive unlock without exclusive lock", w);
            }
            word::with_exclusive_lock(w, false)
        }
    }
}

/// Add `desired` to the word (after `held` is released)
fn acquire_lock(w: u64, desired: LockMode) -> u64 {
    match desired {
        LockMode::None => w,
        LockMode::Read => {
            let count = word::read_lock_count(w);
            if count == word::MAX_READ_LOCKS {
                protocol_violation("read lock count overflow", w);
            }
            word::with_read_lock_count(w, count + 1)
        }
        LockMode::Write => word::with_write_lock(w, true),
        LockMode::Exclusive => word::with_exclusive_lock(w, true),
    }
}

/// Ownership record: the per-cell contention-management word
pub struct Orec {
    word: AtomicU64,
    stats: OrecStats,
}

impl Orec {
    /// A free, unbiased orec
    pub const fn new() -> Self {
        Orec {
            word: AtomicU64::new(0),
            stats: OrecStats::new(),
        }
    }

    /// An orec exclusively locked by its constructing transaction, which
    /// counts as one arrival
    pub fn new_for_construction() -> Self {
        let w = word::with_surplus(word::with_exclusive_lock(0, true), 1);
        Orec {
            word: AtomicU64::new(w),
            stats: OrecStats::new(),
        }
    }

    /// Raw word (Acquire)
    #[inline]
    pub fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Decoded snapshot of the current word
    pub fn state(&self) -> OrecState {
        OrecState::from(self.load())
    }

    /// CAS counters
    pub fn stats(&self) -> &OrecStats {
        &self.stats
    }

    #[inline]
    fn cas(&self, current: u64, next: u64) -> bool {
        let ok = self
            .word
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.stats.record_cas(ok);
        ok
    }

    /// Register as depending on the current version
    pub fn arrive(&self, spin: u32) -> ArriveStatus {
        self.try_lock_and_arrive(spin, LockMode::None)
    }

    /// Arrive and take the exclusive lock in one CAS
    pub fn try_exclusive_lock_and_arrive(&self, spin: u32) -> ArriveStatus {
        self.try_lock_and_arrive(spin, LockMode::Exclusive)
    }

    /// Arrive and take `mode` in one CAS
    ///
    /// On a read-biased orec whose surplus is already 1, a lock-free arrival
    /// returns `Unregistered` without touching the word.
    pub fn try_lock_and_arrive(&self, spin: u32, mode: LockMode) -> ArriveStatus {
        let mut remaining = spin;
        loop {
            let current = self.load();
            let free = if mode == LockMode::None {
                !word::has_exclusive_lock(current)
            } else {
                word::lock_is_free(current, LockMode::None, mode)
            };
            if !free {
                if remaining == 0 {
                    return ArriveStatus::LockNotFree;
                }
                remaining -= 1;
                spin_wait(remaining);
                continue;
            }

            let surplus = word::surplus(current);
            let (next, status) = if word::is_read_biased(current) {
                if surplus > 1 {
                    protocol_violation("read biased orec with surplus above 1", current);
                }
                if surplus == 1 && mode == LockMode::None {
                    return ArriveStatus::Unregistered;
                }
                (word::with_surplus(current, 1), ArriveStatus::Unregistered)
            } else {
                if surplus == word::MAX_SURPLUS {
                    protocol_violation("surplus overflow", current);
                }
                (word::with_surplus(current, surplus + 1), ArriveStatus::Normal)
            };

            if self.cas(current, acquire_lock(next, mode)) {
                return status;
            }
        }
    }

    /// Raise a lock already held (or none) to `desired` without arriving again
    ///
    /// Returns false if the lock could not be acquired within `spin`.
    pub fn try_upgrade_lock(&self, spin: u32, held: LockMode, desired: LockMode) -> bool {
        if desired <= held {
            return true;
        }
        let mut remaining = spin;
        loop {
            let current = self.load();
            if !word::lock_is_free(current, held, desired) {
                if remaining == 0 {
                    return false;
                }
                remaining -= 1;
                spin_wait(remaining);
                continue;
            }
            let released = if held == LockMode::None {
                current
            } else {
                release_lock(current, held)
            };
            if self.cas(current, acquire_lock(released, desired)) {
                return true;
            }
        }
    }

    /// Promote a held write lock to exclusive before publishing
    ///
    /// A write lock keeps every other locker out, so this only loops on
    /// lost races with arrivals.
    pub fn upgrade_write_to_exclusive(&self, held: LockMode) {
        match held {
            LockMode::Exclusive => {}
            LockMode::Write => {
                if !self.try_upgrade_lock(0, LockMode::Write, LockMode::Exclusive) {
                    protocol_violation("write lock could not become exclusive", self.load());
                }
            }
            _ => protocol_violation("publish without a write or exclusive lock", self.load()),
        }
    }

    /// Depart after a read-only use, no lock held
    pub fn depart_after_reading(&self) {
        loop {
            let current = self.load();
            if word::is_read_biased(current) {
                protocol_violation("registered departure from read biased orec", current);
            }
            if word::surplus(current) == 0 {
                protocol_violation("depart without arrive", current);
            }
            if self.cas(current, readonly_departure(current)) {
                return;
            }
        }
    }

    /// Depart after a read-only use and release `held`
    pub fn depart_after_reading_and_unlock(&self, held: LockMode) {
        loop {
            let current = self.load();
            if word::is_read_biased(current) {
                protocol_violation("registered departure from read biased orec", current);
            }
            if word::surplus(current) == 0 {
                protocol_violation("depart without arrive", current);
            }
            let next = readonly_departure(release_lock(current, held));
            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Depart after publishing a new version and drop the exclusive lock
    ///
    /// Returns the surplus left behind: transactions (or, when read biased,
    /// possibly untracked readers) still depending on the old version.
    pub fn depart_after_update_and_unlock(&self) -> u64 {
        loop {
            let current = self.load();
            if !word::has_exclusive_lock(current) {
                protocol_violation("update departure without exclusive lock", current);
            }
            let surplus = word::surplus(current);
            let (next_surplus, remaining) = if word::is_read_biased(current) {
                if surplus > 1 {
                    protocol_violation("read biased orec with surplus above 1", current);
                }
                (0, surplus)
            } else {
                if surplus == 0 {
                    protocol_violation("depart without arrive", current);
                }
                (surplus - 1, surplus - 1)
            };
            let mut next = word::with_exclusive_lock(current, false);
            next = word::with_surplus(next, next_surplus);
            next = word::with_read_biased(next, false);
            next = word::with_readonly_streak(next, 0);
            if self.cas(current, next) {
                return remaining;
            }
        }
    }

    /// Depart after an abort, no lock held
    pub fn depart_after_failure(&self) {
        loop {
            let current = self.load();
            if word::is_read_biased(current) {
                protocol_violation("registered departure from read biased orec", current);
            }
            let surplus = word::surplus(current);
            if surplus == 0 {
                protocol_violation("depart without arrive", current);
            }
            if self.cas(current, word::with_surplus(current, surplus - 1)) {
                return;
            }
        }
    }

    /// Depart after an abort and release `held`
    pub fn depart_after_failure_and_unlock(&self, held: LockMode) {
        loop {
            let current = self.load();
            if word::is_read_biased(current) {
                protocol_violation("registered departure from read biased orec", current);
            }
            let surplus = word::surplus(current);
            if surplus == 0 {
                protocol_violation("depart without arrive", current);
            }
            let next = word::with_surplus(release_lock(current, held), surplus - 1);
            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Release `held` for a party whose arrival was unregistered
    pub fn unlock_when_unregistered(&self, held: LockMode) {
        loop {
            let current = self.load();
            if self.cas(current, release_lock(current, held)) {
                return;
            }
        }
    }
}

impl Default for Orec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Orec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&word::describe(self.load()))
    }
}
