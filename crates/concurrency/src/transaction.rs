//! Transactions
//!
//! A `Transaction` collects one record per cell it touches and publishes
//! all of its writes at once on commit. Reads are validated, never locked,
//! unless the configuration or an explicit `ensure()`/`acquire_lock()` says
//! otherwise.
//!
//! ## Commit Sequence
//!
//! ```text
//! prepare():
//!   1. Lock phase    - dirty writes take Write, ensured reads (and every
//!                      read of a Serializable update) take Read; each
//!                      locked record re-checks the version it read
//!   2. Conflict scan - unlocked reads must still be at the version read and
//!                      not exclusively held by anybody else
//!   3. Commutes      - commuted cells take a commuting Write lock in cell id
//!                      order, waiting out other commuters, and the pending
//!                      functions are folded into the committed value
//! commit():
//!   4. Apply         - upgrade to Exclusive, store the value, version += 1
//!   5. Signal        - advance the global conflict counter if contended
//!   6. Release       - depart every record according to its obligation
//!   7. Notify        - wake parked listeners, run on-commit callbacks
//! ```
//!
//! Any failure before step 4 aborts the transaction and releases every lock
//! it holds. Steps 4-7 cannot fail.

use crate::cell::Cell;
use crate::config::TxnConfig;
use crate::conflict::global_conflict_counter;
use crate::listener::{notify_all, Latch, Listener};
use crate::lock::{Departure, LockFailure};
use crate::record::{Access, CommuteFn, RecordSet, Tranlocal, TxnValue};
use crate::validation::{validate_reads, validate_record};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{CellId, ConflictKind, IsolationLevel, LockMode, StmError, StmResult, TxnId};
use tracing::{debug, trace};

/// Status of a transaction in its lifecycle
///
/// State transitions:
/// - `Active` → `Prepared` (prepare succeeded)
/// - `Active` / `Prepared` → `Committed` (commit)
/// - `Active` / `Prepared` → `Aborted` (abort, conflict, or drop)
///
/// Terminal states (no transitions allowed):
/// - `Committed`
/// - `Aborted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is executing, can read/write
    Active,
    /// Locks are held and reads validated; only commit or abort remain
    Prepared,
    /// Transaction committed successfully
    Committed,
    /// Transaction was aborted
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
}

type Callback = Box<dyn FnOnce() + Send>;

/// One attempt at running a transaction body
pub struct Transaction {
    txn_id: TxnId,
    config: Arc<TxnConfig>,
    status: TransactionStatus,
    records: RecordSet,
    local_conflict_count: u64,
    signal_on_commit: bool,
    attempt: usize,
    start_time: Instant,
    on_commit: Vec<Callback>,
    on_abort: Vec<Callback>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("family", &self.config.family_name)
            .field("status", &self.status)
            .field("records", &self.records.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Transaction {
    /// Start a new attempt
    pub fn new(txn_id: TxnId, config: Arc<TxnConfig>) -> Self {
        Transaction {
            txn_id,
            config,
            status: TransactionStatus::Active,
            records: RecordSet::new(),
            local_conflict_count: global_conflict_counter().count(),
            signal_on_commit: false,
            attempt: 0,
            start_time: Instant::now(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
        }
    }

    /// Tag this transaction with its retry attempt number
    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    // === Accessors ===

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    /// Current status
    pub fn status(&self) -> &TransactionStatus {
        &self.status
    }

    /// Configuration shared by every attempt
    pub fn config(&self) -> &Arc<TxnConfig> {
        &self.config
    }

    /// Zero-based attempt number within the driver loop
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Time since this attempt started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of cells touched so far
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Check if transaction is active
    pub fn is_active(&self) -> bool {
        matches!(self.status, TransactionStatus::Active)
    }

    /// Check if transaction is prepared
    pub fn is_prepared(&self) -> bool {
        matches!(self.status, TransactionStatus::Prepared)
    }

    /// Check if transaction is committed
    pub fn is_committed(&self) -> bool {
        matches!(self.status, TransactionStatus::Committed)
    }

    /// Check if transaction is aborted
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, TransactionStatus::Aborted { .. })
    }

    /// Run `callback` after a successful commit
    pub fn register_on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(callback));
    }

    /// Run `callback` when the transaction aborts
    pub fn register_on_abort(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_abort.push(Box::new(callback));
    }

    // === State checks ===

    fn dead_error(&self) -> StmError {
        StmError::DeadTransaction {
            txn_id: self.txn_id,
            status: format!("{:?}", self.status),
        }
    }

    /// Ensure transaction is in Active state
    pub fn ensure_active(&self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Prepared => Err(StmError::PreparedTransaction {
                txn_id: self.txn_id,
            }),
            _ => Err(self.dead_error()),
        }
    }

    fn ensure_writable(&self) -> StmResult<()> {
        self.ensure_active()?;
        if self.config.readonly {
            return Err(StmError::ReadonlyViolation {
                txn_id: self.txn_id,
            });
        }
        Ok(())
    }

    // === Failure paths ===

    fn fail(&mut self, conflict: ConflictKind) -> StmError {
        trace!(
            target: "strata::txn",
            txn_id = %self.txn_id,
            conflict = %conflict,
            "Conflict detected"
        );
        self.rollback(format!("conflict: {}", conflict));
        StmError::conflict(self.txn_id, conflict)
    }

    fn lock_failure(&mut self, cell: CellId, failure: LockFailure, conflict: ConflictKind) -> StmError {
        match failure {
            LockFailure::Held => self.fail(conflict),
            LockFailure::Poisoned => {
                self.rollback(format!("{} is poisoned", cell));
                StmError::PoisonedCell { cell }
            }
        }
    }

    /// Release everything without publishing and move to Aborted
    fn rollback(&mut self, reason: String) {
        if !matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::Prepared
        ) {
            return;
        }

        let threshold = self.config.read_biased_threshold;
        for record in self.records.iter() {
            let meta = record.meta();
            if meta.access == Access::Construct {
                record.lock().poison();
            } else if meta.lock_mode != LockMode::None || meta.registered {
                record.lock().depart(
                    meta.lock_mode,
                    meta.registered,
                    Departure::AfterFailure,
                    threshold,
                );
            }
        }
        self.records.clear();

        debug!(
            target: "strata::txn",
            txn_id = %self.txn_id,
            family = %self.config.family_name,
            attempt = self.attempt,
            reason = %reason,
            "Transaction aborted"
        );
        self.status = TransactionStatus::Aborted { reason };
        self.on_commit.clear();
        for callback in self.on_abort.drain(..) {
            callback();
        }
    }

    // === Opening cells ===

    fn revalidate_if_needed(&mut self) -> StmResult<()> {
        if !self.config.speculative_consistency {
            return Ok(());
        }
        let current = global_conflict_counter().count();
        if current == self.local_conflict_count {
            return Ok(());
        }
        self.local_conflict_count = current;
        match validate_reads(&self.records) {
            Some(conflict) => Err(self.fail(conflict)),
            None => Ok(()),
        }
    }

    fn upgrade_lock(&mut self, position: usize, requested: LockMode) -> StmResult<()> {
        let meta = *self.records.get(position).meta();
        if requested <= meta.lock_mode {
            return Ok(());
        }

        let acquired = self.records.get(position).lock().try_acquire(
            meta.lock_mode,
            requested,
            meta.registered,
            self.config.spin_count,
        );
        let grant = match acquired {
            Ok(grant) => grant,
            Err(failure) => {
                let conflict = ConflictKind::LockDenied {
                    cell: meta.cell,
                    requested,
                };
                return Err(self.lock_failure(meta.cell, failure, conflict));
            }
        };
        self.records.get_mut(position).meta_mut().lock_mode = requested;
        self.signal_on_commit |= grant.contended;

        if meta.has_read_version() {
            let current_version = self.records.get(position).lock().version();
            if current_version != meta.version {
                return Err(self.fail(ConflictKind::ReadWrite {
                    cell: meta.cell,
                    read_version: meta.version,
                    current_version,
                }));
            }
        }
        Ok(())
    }

    fn force_commutes<T: TxnValue>(&mut self, position: usize) -> StmResult<()> {
        let cell = Arc::clone(&self.records.typed_mut::<T>(position).cell);
        let spin = self.config.spin_count;
        let exclusively_locked = ConflictKind::ExclusivelyLocked { cell: cell.id() };

        let arrival = match cell.lock().arrive(spin) {
            Ok(arrival) => arrival,
            Err(failure) => return Err(self.lock_failure(cell.id(), failure, exclusively_locked)),
        };
        let (version, committed) = match cell.load(spin) {
            Ok(snapshot) => snapshot,
            Err(failure) => {
                self.abandon_arrival(&cell, arrival.is_registered());
                return Err(self.lock_failure(cell.id(), failure, exclusively_locked));
            }
        };

        let keep_original = self.config.dirty_check;
        self.records.typed_mut::<T>(position).force(
            version,
            committed,
            arrival.is_registered(),
            keep_original,
        );
        self.revalidate_if_needed()
    }

    fn abandon_arrival<T: TxnValue>(&self, cell: &Cell<T>, registered: bool) {
        if registered {
            cell.lock().depart(
                LockMode::None,
                true,
                Departure::AfterFailure,
                self.config.read_biased_threshold,
            );
        }
    }

    fn open_record<T: TxnValue>(
        &mut self,
        cell: &Arc<Cell<T>>,
        lock_mode: LockMode,
    ) -> StmResult<usize> {
        if let Some(position) = self.records.position(cell.id()) {
            let access = self.records.get(position).meta().access;
            if self.is_prepared() && access != Access::Commute && lock_mode == LockMode::None {
                return Ok(position);
            }
            self.ensure_active()?;
            if access == Access::Commute {
                self.force_commutes::<T>(position)?;
            }
            self.upgrade_lock(position, lock_mode)?;
            return Ok(position);
        }

        self.ensure_active()?;
        let spin = self.config.spin_count;
        let exclusively_locked = ConflictKind::ExclusivelyLocked { cell: cell.id() };

        let arrival = match cell.lock().arrive(spin) {
            Ok(arrival) => arrival,
            Err(failure) => return Err(self.lock_failure(cell.id(), failure, exclusively_locked)),
        };
        let (version, value) = match cell.load(spin) {
            Ok(snapshot) => snapshot,
            Err(failure) => {
                self.abandon_arrival(cell, arrival.is_registered());
                return Err(self.lock_failure(cell.id(), failure, exclusively_locked));
            }
        };

        let record = Tranlocal::read(Arc::clone(cell), version, value, arrival.is_registered());
        let position = self.records.push(Box::new(record));
        self.upgrade_lock(position, lock_mode)?;
        self.revalidate_if_needed()?;
        Ok(position)
    }

    fn open_write_record<T: TxnValue>(&mut self, cell: &Arc<Cell<T>>) -> StmResult<usize> {
        self.ensure_writable()?;
        let position = self.open_record(cell, self.config.effective_write_lock_mode())?;
        let keep_original = self.config.dirty_check;
        self.records
            .typed_mut::<T>(position)
            .promote_to_write(keep_original);
        Ok(position)
    }

    fn value_at<T: TxnValue>(&mut self, position: usize) -> T {
        let record = self.records.typed_mut::<T>(position);
        match &record.value {
            Some(value) => value.clone(),
            None => unreachable!("{} has no materialised value", record.meta.cell),
        }
    }

    /// Open `cell` for reading, taking at least `lock_mode`
    pub fn open_for_read<T: TxnValue>(
        &mut self,
        cell: &Arc<Cell<T>>,
        lock_mode: LockMode,
    ) -> StmResult<&Tranlocal<T>> {
        let position = self.open_record(cell, lock_mode)?;
        Ok(self.records.typed_mut::<T>(position))
    }

    /// Open `cell` for writing with the configured write lock
    pub fn open_for_write<T: TxnValue>(&mut self, cell: &Arc<Cell<T>>) -> StmResult<&Tranlocal<T>> {
        let position = self.open_write_record(cell)?;
        Ok(self.records.typed_mut::<T>(position))
    }

    /// Create a cell that becomes visible when this transaction commits
    ///
    /// If the transaction aborts instead, the cell is poisoned.
    pub fn open_for_construction<T: TxnValue>(&mut self, value: T) -> StmResult<Arc<Cell<T>>> {
        self.ensure_writable()?;
        let cell = Arc::new(Cell::new_constructing(value.clone()));
        self.records
            .push(Box::new(Tranlocal::constructed(Arc::clone(&cell), value)));
        Ok(cell)
    }

    /// Queue a commutative update on `cell`
    ///
    /// The cell is not read. The function is applied to whatever value is
    /// committed when this transaction prepares, unless the transaction
    /// reads the cell first, in which case the queue is applied right then.
    pub fn commute<T: TxnValue>(&mut self, cell: &Arc<Cell<T>>, function: CommuteFn<T>) -> StmResult<()> {
        self.ensure_writable()?;
        let Some(position) = self.records.position(cell.id()) else {
            self.records
                .push(Box::new(Tranlocal::commuting(Arc::clone(cell), function)));
            return Ok(());
        };

        if self.records.get(position).meta().access == Access::Commute {
            self.records.typed_mut::<T>(position).commutes.push(function);
            return Ok(());
        }

        let position = self.open_write_record(cell)?;
        let current = self.value_at::<T>(position);
        self.records.typed_mut::<T>(position).set(function(current));
        Ok(())
    }

    // === Typed helpers used by TxnRef ===

    pub(crate) fn read_cell<T: TxnValue>(&mut self, cell: &Arc<Cell<T>>) -> StmResult<T> {
        let position = self.open_record(cell, self.config.read_lock_mode)?;
        Ok(self.value_at::<T>(position))
    }

    pub(crate) fn write_cell<T: TxnValue>(&mut self, cell: &Arc<Cell<T>>, value: T) -> StmResult<()> {
        let position = self.open_write_record(cell)?;
        self.records.typed_mut::<T>(position).set(value);
        Ok(())
    }

    pub(crate) fn modify_cell<T: TxnValue, R>(
        &mut self,
        cell: &Arc<Cell<T>>,
        f: impl FnOnce(&T) -> (T, R),
    ) -> StmResult<R> {
        let position = self.open_write_record(cell)?;
        let record = self.records.typed_mut::<T>(position);
        let (next, result) = match record.value.as_ref() {
            Some(current) => f(current),
            None => unreachable!("{} has no materialised value", record.meta.cell),
        };
        record.set(next);
        Ok(result)
    }

    pub(crate) fn ensure_cell<T: TxnValue>(&mut self, cell: &Arc<Cell<T>>) -> StmResult<()> {
        let position = self.open_record(cell, self.config.read_lock_mode)?;
        self.records.get_mut(position).meta_mut().ensured = true;
        Ok(())
    }

    // === Lifecycle ===

    /// Control signal asking the driver to block until a read cell changes
    pub fn retry<T>(&self) -> StmResult<T> {
        self.ensure_active()?;
        Err(StmError::Retry)
    }

    /// Lock, validate and resolve commutes without publishing anything
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => {}
            TransactionStatus::Prepared => return Ok(()),
            _ => return Err(self.dead_error()),
        }

        let dirty_check = self.config.dirty_check;
        let mut updating = false;
        for record in self.records.iter_mut() {
            if record.meta().is_update() && record.refresh_dirty(dirty_check) {
                updating = true;
            }
        }
        let serializable = self.config.isolation_level == IsolationLevel::Serializable;

        for position in 0..self.records.len() {
            let meta = *self.records.get(position).meta();
            let needed = match meta.access {
                Access::Construct | Access::Commute => continue,
                _ if meta.dirty => LockMode::Write,
                _ if meta.ensured || (serializable && updating) => LockMode::Read,
                _ => continue,
            };
            self.upgrade_lock(position, needed)?;
        }

        let stale = self
            .records
            .iter()
            .filter(|r| r.meta().lock_mode == LockMode::None)
            .find_map(|r| validate_record(r));
        if let Some(conflict) = stale {
            return Err(self.fail(conflict));
        }

        self.resolve_commutes()?;

        self.status = TransactionStatus::Prepared;
        trace!(
            target: "strata::txn",
            txn_id = %self.txn_id,
            records = self.records.len(),
            "Transaction prepared"
        );
        Ok(())
    }

    /// Lock every commuted cell and fold its pending functions
    ///
    /// Runs after all other locks are held. A commuted cell is never read,
    /// so waiting for another commuter to release it cannot invalidate
    /// anything; only a plain writer holding the cell makes this fail.
    fn resolve_commutes(&mut self) -> StmResult<()> {
        let mut commuted: Vec<(CellId, usize)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.meta().access == Access::Commute)
            .map(|(position, r)| (r.meta().cell, position))
            .collect();
        if commuted.is_empty() {
            return Ok(());
        }
        commuted.sort_unstable();

        let spin = self.config.spin_count;
        let dirty_check = self.config.dirty_check;
        for (cell, position) in commuted {
            if let Err(failure) = self.records.get(position).lock().acquire_commuting(spin) {
                let conflict = ConflictKind::LockDenied {
                    cell,
                    requested: LockMode::Write,
                };
                return Err(self.lock_failure(cell, failure, conflict));
            }
            let record = self.records.get_mut(position);
            record.meta_mut().lock_mode = LockMode::Write;
            record.resolve_commutes(dirty_check);
        }
        Ok(())
    }

    /// Publish every write atomically
    ///
    /// Prepares first if the transaction is still active.
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => self.prepare()?,
            TransactionStatus::Prepared => {}
            _ => return Err(self.dead_error()),
        }

        let mut signal = self.signal_on_commit;
        let mut listeners: Vec<Listener> = Vec::new();
        let mut updates = 0usize;

        for record in self.records.iter_mut() {
            let meta = *record.meta();
            if !(meta.is_update() && meta.dirty) {
                continue;
            }
            let grant = match record.lock().try_acquire(
                meta.lock_mode,
                LockMode::Exclusive,
                meta.registered,
                0,
            ) {
                Ok(grant) => grant,
                Err(failure) => unreachable!(
                    "{} lock on {} could not be upgraded at commit: {:?}",
                    meta.lock_mode, meta.cell, failure
                ),
            };
            signal |= grant.contended;
            record.meta_mut().lock_mode = LockMode::Exclusive;
            listeners.extend(record.publish());
            updates += 1;
        }

        if signal {
            global_conflict_counter().signal_conflict();
        }

        let threshold = self.config.read_biased_threshold;
        for record in self.records.iter() {
            let meta = record.meta();
            let departure = if meta.is_update() && meta.dirty {
                Departure::AfterUpdate
            } else {
                Departure::AfterReading
            };
            if meta.lock_mode != LockMode::None || meta.registered {
                record
                    .lock()
                    .depart(meta.lock_mode, meta.registered, departure, threshold);
            }
        }
        self.records.clear();
        self.status = TransactionStatus::Committed;

        debug!(
            target: "strata::txn",
            txn_id = %self.txn_id,
            family = %self.config.family_name,
            attempt = self.attempt,
            updates,
            contended = signal,
            "Transaction committed"
        );

        notify_all(listeners);
        self.on_abort.clear();
        for callback in self.on_commit.drain(..) {
            callback();
        }
        Ok(())
    }

    /// Abort the transaction
    ///
    /// Aborting an aborted transaction is a no-op; aborting a committed one
    /// is an error.
    pub fn abort(&mut self) -> StmResult<()> {
        self.abort_with_reason("aborted by caller")
    }

    /// Abort with an explicit reason
    pub fn abort_with_reason(&mut self, reason: impl Into<String>) -> StmResult<()> {
        match self.status {
            TransactionStatus::Committed => Err(self.dead_error()),
            TransactionStatus::Aborted { .. } => Ok(()),
            _ => {
                self.rollback(reason.into());
                Ok(())
            }
        }
    }

    /// Park until a cell this transaction read changes
    ///
    /// Called by the retry driver after the body returned `Retry`. Parks a
    /// listener on every cell read, aborts the attempt, then waits on
    /// `latch` until a listener fires or `deadline` passes.
    pub fn block_until_changed(
        &mut self,
        latch: &Arc<Latch>,
        deadline: Option<Instant>,
    ) -> StmResult<()> {
        self.ensure_active()?;
        let txn_id = self.txn_id;

        if !self.config.blocking_allowed {
            self.rollback("retry requested with blocking disabled".to_string());
            return Err(StmError::RetryNotAllowed { txn_id });
        }

        let era = latch.era();
        let listener = Listener::new(Arc::clone(latch), era);
        let mut parked = 0usize;
        for record in self.records.iter() {
            if record.meta().has_read_version() {
                record.park(&listener);
                parked += 1;
            }
        }
        if parked == 0 {
            self.rollback("retry requested without reads".to_string());
            return Err(StmError::NoRetryPossible { txn_id });
        }

        self.rollback("blocked on retry".to_string());
        debug!(target: "strata::txn", txn_id = %txn_id, parked, "Transaction parked");

        let waiting_since = Instant::now();
        let woken = latch.await_open(era, deadline);
        latch.reset();
        if woken {
            Ok(())
        } else {
            Err(StmError::Timeout {
                txn_id,
                waited: waiting_since.elapsed(),
            })
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback("dropped before completion".to_string());
    }
}
