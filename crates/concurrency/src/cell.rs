//! Transactional cells
//!
//! A `Cell<T>` pairs a value with its [`VersionedLock`] and the chain of
//! listeners parked on it by blocking retries. Cells are shared between
//! threads behind an `Arc`; the typed handle users see is `TxnRef<T>`.
//!
//! The value slot sits behind a `parking_lot::RwLock` so that copying a
//! value out never races with a publisher. Consistency of what a reader
//! observes is decided by the lock word and version, not by that lock:
//! a load is only accepted when the version did not move while the value
//! was being copied and no exclusive lock was visible on either side.

use crate::listener::{Listener, ListenerChain};
use crate::lock::{LockFailure, VersionedLock};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{CellId, LockMode};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

fn next_cell_id() -> CellId {
    CellId::new(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
}

/// A versioned transactional memory cell
#[derive(Debug)]
pub struct Cell<T> {
    id: CellId,
    lock: VersionedLock,
    value: RwLock<T>,
    listeners: ListenerChain,
}

impl<T: Clone> Cell<T> {
    /// Committed cell at version 0
    pub fn new(value: T) -> Self {
        Cell {
            id: next_cell_id(),
            lock: VersionedLock::new(),
            value: RwLock::new(value),
            listeners: ListenerChain::new(),
        }
    }

    /// Cell created inside a transaction, exclusively locked by its creator
    pub(crate) fn new_constructing(value: T) -> Self {
        Cell {
            id: next_cell_id(),
            lock: VersionedLock::new_constructing(),
            value: RwLock::new(value),
            listeners: ListenerChain::new(),
        }
    }

    /// Process-unique identity
    pub fn id(&self) -> CellId {
        self.id
    }

    /// The cell's lock word
    pub fn lock(&self) -> &VersionedLock {
        &self.lock
    }

    /// Last committed version
    pub fn version(&self) -> u64 {
        self.lock.version()
    }

    /// Consistent snapshot of `(version, value)`
    ///
    /// Spins while the cell is exclusively locked and gives up with
    /// `LockFailure::Held` after `spin` attempts.
    pub fn load(&self, spin: u32) -> Result<(u64, T), LockFailure> {
        let mut remaining = spin;
        loop {
            let before = self.lock.word();
            if before.is_poisoned() {
                return Err(LockFailure::Poisoned);
            }
            if before.lock_mode() == LockMode::Exclusive {
                if remaining == 0 {
                    return Err(LockFailure::Held);
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }

            let version = self.lock.version();
            let value = self.value.read().clone();

            let after = self.lock.word();
            if after.lock_mode() != LockMode::Exclusive && self.lock.version() == version {
                return Ok((version, value));
            }
            std::hint::spin_loop();
        }
    }

    /// Copy of the current value with no consistency check
    pub fn load_unchecked(&self) -> T {
        self.value.read().clone()
    }

    /// Install `value` as the next committed version
    ///
    /// The caller must hold the exclusive lock. Returns the listeners that
    /// were parked on the previous version.
    pub(crate) fn publish(&self, value: T) -> Vec<Listener> {
        *self.value.write() = value;
        let next = self.lock.version() + 1;
        self.lock.publish_version(next);
        self.listeners.take()
    }

    /// Listeners parked on this cell
    pub(crate) fn listeners(&self) -> &ListenerChain {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::Departure;

    #[test]
    fn test_cell_ids_are_unique() {
        let a = Cell::new(1);
        let b = Cell::new(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_load_free_cell() {
        let cell = Cell::new(String::from("hello"));
        let (version, value) = cell.load(0).unwrap();
        assert_eq!(version, 0);
        assert_eq!(value, "hello");
    }

    #[test]
    fn test_load_fails_while_exclusive() {
        let cell = Cell::new(5u64);
        cell.lock()
            .try_acquire(LockMode::None, LockMode::Exclusive, false, 0)
            .unwrap();
        assert_eq!(cell.load(16), Err(LockFailure::Held));
    }

    #[test]
    fn test_load_allowed_under_write_lock() {
        let cell = Cell::new(5u64);
        cell.lock()
            .try_acquire(LockMode::None, LockMode::Write, false, 0)
            .unwrap();
        assert_eq!(cell.load(0), Ok((0, 5)));
    }

    #[test]
    fn test_publish_bumps_version_by_one() {
        let cell = Cell::new(5u64);
        cell.lock()
            .try_acquire(LockMode::None, LockMode::Exclusive, false, 0)
            .unwrap();
        cell.publish(6);
        cell.lock()
            .depart(LockMode::Exclusive, false, Departure::AfterUpdate, 128);
        assert_eq!(cell.load(0), Ok((1, 6)));
    }

    #[test]
    fn test_constructing_cell_is_invisible() {
        let cell = Cell::new_constructing(1u8);
        assert_eq!(cell.load(0), Err(LockFailure::Held));
        cell.lock().poison();
        assert_eq!(cell.load(0), Err(LockFailure::Poisoned));
    }
}
