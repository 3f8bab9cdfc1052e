//! Global conflict counter for speculative read consistency
//!
//! A writer that publishes a cell other transactions may have read advances
//! this counter before it releases its locks. Every transaction remembers
//! the value it last saw; when it opens a new cell and finds the counter
//! moved, it revalidates all of its reads before returning the new value.
//! That is what keeps a running transaction from ever observing a mix of
//! two different commits.
//!
//! The counter is process-wide: transaction-free updates on a cell need to
//! signal it too, and they are not tied to any particular runtime.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter of contended commits
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: AtomicU64,
}

impl GlobalConflictCounter {
    /// Counter starting at zero
    pub const fn new() -> Self {
        GlobalConflictCounter {
            count: AtomicU64::new(0),
        }
    }

    /// Current value
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Advance the counter; returns the new value
    pub fn signal_conflict(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

static GLOBAL_CONFLICT_COUNTER: GlobalConflictCounter = GlobalConflictCounter::new();

/// The process-wide counter
pub fn global_conflict_counter() -> &'static GlobalConflictCounter {
    &GLOBAL_CONFLICT_COUNTER
}
