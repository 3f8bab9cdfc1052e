//! Transaction-local records
//!
//! A transaction keeps one record per cell it touched. The record holds the
//! version observed when the cell was opened, the working value, the lock
//! mode the transaction holds, and any commutative functions still waiting
//! to be applied.
//!
//! Records are generic over the cell's value type. The transaction stores
//! them as `Box<dyn AnyRecord>` so that one transaction can span cells of
//! different types; typed access goes back through `Any`.

use crate::cell::Cell;
use crate::listener::Listener;
use crate::lock::VersionedLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::any::Any;
use std::sync::Arc;
use strata_core::{CellId, LockMode};

/// Bound for values stored in transactional cells
///
/// Values are copied into transaction-local records and compared for the
/// dirty check, so they must be `Clone + PartialEq`.
pub trait TxnValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> TxnValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Deferred update applied to the committed value at prepare time
pub type CommuteFn<T> = Box<dyn FnOnce(T) -> T + Send>;

/// How a transaction touched a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Opened for reading
    Read,
    /// Opened for writing
    Write,
    /// Only commutative updates so far; nothing read
    Commute,
    /// Created by this transaction
    Construct,
}

/// Type-independent part of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    /// The cell
    pub cell: CellId,
    /// How the cell was touched
    pub access: Access,
    /// Version observed when the cell was read
    pub version: u64,
    /// Lock held on the cell
    pub lock_mode: LockMode,
    /// Whether this transaction is counted in the cell's surplus
    pub registered: bool,
    /// Read must be lock-protected at prepare
    pub ensured: bool,
    /// Working value differs from the committed one
    pub dirty: bool,
}

impl RecordMeta {
    /// Whether `version` holds a real observation
    pub fn has_read_version(&self) -> bool {
        matches!(self.access, Access::Read | Access::Write)
    }

    /// Whether commit may publish a new value for this cell
    pub fn is_update(&self) -> bool {
        !matches!(self.access, Access::Read)
    }
}

/// Working copy of one cell inside a transaction
pub struct Tranlocal<T> {
    pub(crate) meta: RecordMeta,
    pub(crate) cell: Arc<Cell<T>>,
    pub(crate) value: Option<T>,
    pub(crate) original: Option<T>,
    pub(crate) commutes: Vec<CommuteFn<T>>,
}

impl<T: TxnValue> Tranlocal<T> {
    pub(crate) fn read(
        cell: Arc<Cell<T>>,
        version: u64,
        value: T,
        registered: bool,
    ) -> Self {
        Tranlocal {
            meta: RecordMeta {
                cell: cell.id(),
                access: Access::Read,
                version,
                lock_mode: LockMode::None,
                registered,
                ensured: false,
                dirty: false,
            },
            cell,
            value: Some(value),
            original: None,
            commutes: Vec::new(),
        }
    }

    pub(crate) fn commuting(cell: Arc<Cell<T>>, function: CommuteFn<T>) -> Self {
        Tranlocal {
            meta: RecordMeta {
                cell: cell.id(),
                access: Access::Commute,
                version: 0,
                lock_mode: LockMode::None,
                registered: false,
                ensured: false,
                dirty: true,
            },
            cell,
            value: None,
            original: None,
            commutes: vec![function],
        }
    }

    pub(crate) fn constructed(cell: Arc<Cell<T>>, value: T) -> Self {
        Tranlocal {
            meta: RecordMeta {
                cell: cell.id(),
                access: Access::Construct,
                version: 0,
                lock_mode: LockMode::Exclusive,
                registered: true,
                ensured: false,
                dirty: true,
            },
            cell,
            value: Some(value),
            original: None,
            commutes: Vec::new(),
        }
    }

    /// The working value, if it has been materialised
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Turn a read record into a write record
    pub(crate) fn promote_to_write(&mut self, keep_original: bool) {
        if self.meta.access == Access::Read {
            self.meta.access = Access::Write;
            if keep_original {
                self.original = self.value.clone();
            }
        }
    }

    /// Replace the working value
    pub(crate) fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Fold the pending commutes into a freshly read committed value
    ///
    /// Called when the transaction reads a cell it had only commuted on.
    /// The record becomes a write record observing `version`.
    pub(crate) fn force(&mut self, version: u64, committed: T, registered: bool, keep_original: bool) {
        if keep_original {
            self.original = Some(committed.clone());
        }
        let value = self.commutes.drain(..).fold(committed, |acc, f| f(acc));
        self.value = Some(value);
        self.meta.access = Access::Write;
        self.meta.version = version;
        self.meta.registered = registered;
    }
}

/// Object-safe view of a record used by the commit protocol
pub(crate) trait AnyRecord: Send {
    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn lock(&self) -> &VersionedLock;

    /// Recompute and store the dirty flag
    fn refresh_dirty(&mut self, dirty_check: bool) -> bool;

    /// Fold pending commutes into the committed value and return whether
    /// the result is dirty
    ///
    /// The caller holds the write lock on the cell, so the committed value
    /// cannot move underneath the fold.
    fn resolve_commutes(&mut self, dirty_check: bool) -> bool;

    /// Publish the working value; the caller holds the exclusive lock
    fn publish(&mut self) -> Vec<Listener>;

    /// Park `listener` on the cell
    ///
    /// Returns true if the cell already moved past the version observed,
    /// in which case the listener has been notified.
    fn park(&self, listener: &Listener) -> bool;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: TxnValue> AnyRecord for Tranlocal<T> {
    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn lock(&self) -> &VersionedLock {
        self.cell.lock()
    }

    fn refresh_dirty(&mut self, dirty_check: bool) -> bool {
        let dirty = match self.meta.access {
            Access::Read => false,
            // settled by resolve_commutes once the committed value is known
            Access::Commute => true,
            Access::Construct => true,
            Access::Write => !dirty_check || self.original != self.value,
        };
        self.meta.dirty = dirty;
        dirty
    }

    fn resolve_commutes(&mut self, dirty_check: bool) -> bool {
        let committed = self.cell.load_unchecked();
        let value = self
            .commutes
            .drain(..)
            .fold(committed.clone(), |acc, f| f(acc));
        let dirty = !dirty_check || value != committed;
        self.original = Some(committed);
        self.value = Some(value);
        self.meta.version = self.cell.version();
        self.meta.dirty = dirty;
        dirty
    }

    fn publish(&mut self) -> Vec<Listener> {
        match self.value.clone() {
            Some(value) => self.cell.publish(value),
            None => unreachable!("publishing {} without a value", self.meta.cell),
        }
    }

    fn park(&self, listener: &Listener) -> bool {
        self.cell.listeners().push(listener.clone());
        if self.cell.version() != self.meta.version {
            listener.notify();
            true
        } else {
            false
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const INLINE_RECORDS: usize = 8;
const INDEX_THRESHOLD: usize = 16;

/// Records of one transaction, in the order they were opened
///
/// Small transactions are scanned linearly; once the set grows past a
/// threshold an id index is built and maintained.
#[derive(Default)]
pub(crate) struct RecordSet {
    records: SmallVec<[Box<dyn AnyRecord>; INLINE_RECORDS]>,
    index: Option<FxHashMap<CellId, usize>>,
}

impl RecordSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    pub(crate) fn position(&self, cell: CellId) -> Option<usize> {
        match &self.index {
            Some(index) => index.get(&cell).copied(),
            None => self.records.iter().position(|r| r.meta().cell == cell),
        }
    }

    pub(crate) fn push(&mut self, record: Box<dyn AnyRecord>) -> usize {
        let position = self.records.len();
        let cell = record.meta().cell;
        self.records.push(record);
        match &mut self.index {
            Some(index) => {
                index.insert(cell, position);
            }
            None if self.records.len() > INDEX_THRESHOLD => {
                let index = self
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (r.meta().cell, i))
                    .collect();
                self.index = Some(index);
            }
            None => {}
        }
        position
    }

    pub(crate) fn get(&self, position: usize) -> &dyn AnyRecord {
        self.records[position].as_ref()
    }

    pub(crate) fn get_mut(&mut self, position: usize) -> &mut dyn AnyRecord {
        self.records[position].as_mut()
    }

    pub(crate) fn typed_mut<T: TxnValue>(&mut self, position: usize) -> &mut Tranlocal<T> {
        let record = self.records[position].as_mut();
        let cell = record.meta().cell;
        match record.as_any_mut().downcast_mut::<Tranlocal<T>>() {
            Some(record) => record,
            None => unreachable!("record for {} opened with a different value type", cell),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn AnyRecord> {
        self.records.iter().map(|r| r.as_ref())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn AnyRecord>> {
        self.records.iter_mut()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_record(value: i64) -> Box<dyn AnyRecord> {
        let cell = Arc::new(Cell::new(value));
        Box::new(Tranlocal::read(cell, 0, value, true))
    }

    #[test]
    fn test_record_set_linear_lookup() {
        let mut set = RecordSet::new();
        let a = read_record(1);
        let a_id = a.meta().cell;
        set.push(a);
        set.push(read_record(2));
        assert_eq!(set.len(), 2);
        assert!(!set.is_indexed());
        assert_eq!(set.position(a_id), Some(0));
        assert_eq!(set.position(CellId::new(u64::MAX)), None);
    }

    #[test]
    fn test_record_set_builds_index_past_threshold() {
        let mut set = RecordSet::new();
        let mut ids = Vec::new();
        for i in 0..(INDEX_THRESHOLD + 4) {
            let record = read_record(i as i64);
            ids.push(record.meta().cell);
            set.push(record);
        }
        assert!(set.is_indexed());
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(set.position(*id), Some(i));
        }
        set.clear();
        assert!(set.is_empty());
        assert!(!set.is_indexed());
    }

    #[test]
    fn test_dirty_check_compares_values() {
        let cell = Arc::new(Cell::new(10i64));
        let mut record = Tranlocal::read(cell, 0, 10, true);
        record.promote_to_write(true);
        record.set(10);
        assert!(!record.refresh_dirty(true));
        assert!(record.refresh_dirty(false));
        record.set(11);
        assert!(record.refresh_dirty(true));
    }

    #[test]
    fn test_force_applies_commutes_in_order() {
        let cell = Arc::new(Cell::new(1i64));
        let mut record = Tranlocal::commuting(Arc::clone(&cell), Box::new(|v: i64| v + 1));
        record.commutes.push(Box::new(|v: i64| v * 10));
        record.force(3, 5, true, true);
        assert_eq!(record.value(), Some(&60));
        assert_eq!(record.meta.access, Access::Write);
        assert_eq!(record.meta.version, 3);
        assert!(record.commutes.is_empty());
    }

    #[test]
    fn test_resolved_commute_dirty_only_if_value_changes() {
        let cell = Arc::new(Cell::new(7i64));

        let mut identity = Tranlocal::commuting(Arc::clone(&cell), Box::new(|v: i64| v));
        assert!(!identity.resolve_commutes(true));
        assert!(!identity.meta.dirty);
        assert_eq!(identity.value(), Some(&7));
        assert_eq!(identity.original, Some(7));

        let mut unchecked = Tranlocal::commuting(Arc::clone(&cell), Box::new(|v: i64| v));
        assert!(unchecked.resolve_commutes(false));

        let mut bump = Tranlocal::commuting(cell, Box::new(|v: i64| v + 1));
        assert!(bump.resolve_commutes(true));
        assert_eq!(bump.value(), Some(&8));
    }

    #[test]
    fn test_typed_access_round_trips() {
        let mut set = RecordSet::new();
        let position = set.push(read_record(42));
        let typed = set.typed_mut::<i64>(position);
        assert_eq!(typed.value(), Some(&42));
    }

    #[test]
    fn test_meta_classification() {
        let cell = Arc::new(Cell::new(0u8));
        let read = Tranlocal::read(Arc::clone(&cell), 0, 0, false);
        assert!(read.meta.has_read_version());
        assert!(!read.meta.is_update());
        let commute = Tranlocal::commuting(cell, Box::new(|v: u8| v));
        assert!(!commute.meta.has_read_version());
        assert!(commute.meta.is_update());
    }
}
