//! Typed references to transactional cells
//!
//! `TxnRef<T>` is the handle applications hold. It is cheap to clone and
//! can be shared between threads. Inside a transaction every access goes
//! through the transaction's record for the cell; the `atomic_*` family
//! works on the cell directly, without a transaction, by taking the
//! exclusive lock for the duration of a single update.

use crate::cell::Cell;
use crate::conflict::global_conflict_counter;
use crate::listener::notify_all;
use crate::lock::{Departure, LockFailure, VersionedLock, DEFAULT_READ_BIASED_THRESHOLD};
use crate::record::TxnValue;
use crate::transaction::Transaction;
use std::fmt;
use std::sync::Arc;
use strata_core::{CellId, LockMode, StmError, StmResult};

/// Spins a transaction-free operation makes on a locked cell
pub const ATOMIC_SPIN_COUNT: u32 = 64;

/// Exclusive lock held by a transaction-free update
///
/// Dropped without `release`, e.g. while unwinding out of the update
/// function, it departs as a failure: the cell keeps its value and is
/// unlocked again.
struct ExclusiveSection<'a> {
    lock: &'a VersionedLock,
    held: bool,
}

impl<'a> ExclusiveSection<'a> {
    fn new(lock: &'a VersionedLock) -> Self {
        ExclusiveSection { lock, held: true }
    }

    fn release(mut self, departure: Departure) {
        self.held = false;
        self.lock.depart(
            LockMode::Exclusive,
            false,
            departure,
            DEFAULT_READ_BIASED_THRESHOLD,
        );
    }
}

impl Drop for ExclusiveSection<'_> {
    fn drop(&mut self) {
        if self.held {
            self.lock.depart(
                LockMode::Exclusive,
                false,
                Departure::AfterFailure,
                DEFAULT_READ_BIASED_THRESHOLD,
            );
        }
    }
}

/// Shared handle to a transactional cell
pub struct TxnRef<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for TxnRef<T> {
    fn clone(&self) -> Self {
        TxnRef {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> PartialEq for TxnRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> Eq for TxnRef<T> {}

impl<T: TxnValue + fmt::Debug> fmt::Debug for TxnRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnRef")
            .field("id", &self.cell.id())
            .field("version", &self.cell.version())
            .field("value", &self.cell.load_unchecked())
            .finish()
    }
}

impl<T: TxnValue> TxnRef<T> {
    /// Committed cell holding `value` at version 0
    pub fn new(value: T) -> Self {
        TxnRef {
            cell: Arc::new(Cell::new(value)),
        }
    }

    /// Cell created inside `tx`, published when `tx` commits
    pub fn new_in(tx: &mut Transaction, value: T) -> StmResult<Self> {
        let cell = tx.open_for_construction(value)?;
        Ok(TxnRef { cell })
    }

    /// Identity of the underlying cell
    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    /// The underlying cell
    pub fn cell(&self) -> &Arc<Cell<T>> {
        &self.cell
    }

    // === Transactional access ===

    /// Read the value as seen by `tx`
    pub fn read(&self, tx: &mut Transaction) -> StmResult<T> {
        tx.read_cell(&self.cell)
    }

    /// Replace the value in `tx`
    pub fn write(&self, tx: &mut Transaction, value: T) -> StmResult<()> {
        tx.write_cell(&self.cell, value)
    }

    /// Replace the value in `tx`, returning the previous one
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> StmResult<T> {
        tx.modify_cell(&self.cell, |old| (value, old.clone()))
    }

    /// Apply `f` in `tx`, returning the new value
    pub fn alter(&self, tx: &mut Transaction, f: impl FnOnce(&T) -> T) -> StmResult<T> {
        tx.modify_cell(&self.cell, |old| {
            let next = f(old);
            (next.clone(), next)
        })
    }

    /// Queue a commutative update
    ///
    /// The cell is not read, so commits by other transactions cannot
    /// invalidate this one on it.
    pub fn commute(
        &self,
        tx: &mut Transaction,
        f: impl FnOnce(T) -> T + Send + 'static,
    ) -> StmResult<()> {
        tx.commute(&self.cell, Box::new(f))
    }

    /// Protect the read of this cell against concurrent writers until commit
    pub fn ensure(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.ensure_cell(&self.cell)
    }

    /// Take at least `mode` on the cell for the rest of `tx`
    pub fn acquire_lock(&self, tx: &mut Transaction, mode: LockMode) -> StmResult<()> {
        tx.open_for_read(&self.cell, mode).map(|_| ())
    }

    /// Read the value, blocking the transaction until `predicate` holds
    pub fn await_value(
        &self,
        tx: &mut Transaction,
        predicate: impl FnOnce(&T) -> bool,
    ) -> StmResult<T> {
        let value = self.read(tx)?;
        if predicate(&value) {
            Ok(value)
        } else {
            tx.retry()
        }
    }

    // === Transaction-free access ===

    fn atomic_error(&self, failure: LockFailure) -> StmError {
        match failure {
            LockFailure::Held => StmError::Locked {
                cell: self.cell.id(),
            },
            LockFailure::Poisoned => StmError::PoisonedCell {
                cell: self.cell.id(),
            },
        }
    }

    /// Exclusively lock the cell, run `f` on the current value and publish
    /// its result if it differs
    ///
    /// Returns the previous value and what `f` produced.
    fn atomic_update(&self, f: impl FnOnce(&T) -> Option<T>) -> StmResult<(T, Option<T>)> {
        let lock = self.cell.lock();
        let grant = lock
            .try_acquire(LockMode::None, LockMode::Exclusive, false, ATOMIC_SPIN_COUNT)
            .map_err(|failure| self.atomic_error(failure))?;
        let section = ExclusiveSection::new(lock);

        let old = self.cell.load_unchecked();
        let next = f(&old);
        match &next {
            Some(value) if *value != old => {
                let listeners = self.cell.publish(value.clone());
                if grant.contended {
                    global_conflict_counter().signal_conflict();
                }
                section.release(Departure::AfterUpdate);
                notify_all(listeners);
            }
            _ => section.release(Departure::AfterFailure),
        }
        Ok((old, next))
    }

    /// Consistent read of the committed value
    ///
    /// Fails with `Locked` if the cell stays exclusively locked.
    pub fn atomic_get(&self) -> StmResult<T> {
        self.cell
            .load(ATOMIC_SPIN_COUNT)
            .map(|(_, value)| value)
            .map_err(|failure| self.atomic_error(failure))
    }

    /// Read of the committed value that never fails
    ///
    /// May return a value that is being replaced by a concurrent commit.
    pub fn atomic_weak_get(&self) -> T {
        self.cell.load_unchecked()
    }

    /// Publish `value` as a single-cell transaction
    pub fn atomic_set(&self, value: T) -> StmResult<()> {
        self.atomic_update(|_| Some(value)).map(|_| ())
    }

    /// Publish `value`, returning the previous value
    pub fn atomic_get_and_set(&self, value: T) -> StmResult<T> {
        self.atomic_update(|_| Some(value)).map(|(old, _)| old)
    }

    /// Publish `new` if the current value equals `expected`
    pub fn atomic_compare_and_set(&self, expected: &T, new: T) -> StmResult<bool> {
        self.atomic_update(|current| (current == expected).then_some(new))
            .map(|(_, next)| next.is_some())
    }

    /// Publish `f(current)`, returning the new value
    pub fn atomic_alter(&self, f: impl FnOnce(&T) -> T) -> StmResult<T> {
        let (old, next) = self.atomic_update(|current| Some(f(current)))?;
        Ok(next.unwrap_or(old))
    }

    // === Introspection ===

    /// Last committed version
    pub fn version(&self) -> u64 {
        self.cell.version()
    }

    /// Lock mode currently held on the cell by anybody
    pub fn lock_mode(&self) -> LockMode {
        self.cell.lock().word().lock_mode()
    }

    /// Number of arrived parties
    pub fn surplus(&self) -> u32 {
        self.cell.lock().word().surplus()
    }

    /// Whether reads of this cell skip arrive/depart bookkeeping
    pub fn is_read_biased(&self) -> bool {
        self.cell.lock().word().is_read_biased()
    }
}

/// Block the current transaction until something it read changes
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}

/// Retry unless `condition` holds
pub fn guard(condition: bool) -> StmResult<()> {
    if condition {
        Ok(())
    } else {
        retry()
    }
}

/// Unwrap `option`, retrying on `None`
pub fn unwrap_or_retry<T>(option: Option<T>) -> StmResult<T> {
    match option {
        Some(value) => Ok(value),
        None => retry(),
    }
}
