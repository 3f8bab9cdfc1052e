//! Read validation
//!
//! Reads are validated in two places:
//! - the conflict scan of `prepare()`, for read records that hold no lock
//! - speculative revalidation, whenever a transaction opens a new cell and
//!   finds that the global conflict counter moved
//!
//! Both apply the same rule: a read is still valid if the cell's version is
//! unchanged and no other party holds the exclusive lock on it. A foreign
//! `Write` lock is fine: its owner has not published anything yet.

use crate::record::{AnyRecord, RecordSet};
use strata_core::{ConflictKind, LockMode};

/// Check a single record that observed a version
///
/// Returns the conflict that invalidates the read, if any. Records without
/// a read version are always valid.
pub(crate) fn validate_record(record: &dyn AnyRecord) -> Option<ConflictKind> {
    let meta = record.meta();
    if !meta.has_read_version() {
        return None;
    }

    let lock = record.lock();
    let current_version = lock.version();
    if current_version != meta.version {
        return Some(ConflictKind::ReadWrite {
            cell: meta.cell,
            read_version: meta.version,
            current_version,
        });
    }

    if meta.lock_mode != LockMode::Exclusive && lock.word().lock_mode() == LockMode::Exclusive {
        return Some(ConflictKind::ExclusivelyLocked { cell: meta.cell });
    }

    None
}

/// First conflict among the records, in the order they were opened
pub(crate) fn validate_reads(records: &RecordSet) -> Option<ConflictKind> {
    records.iter().find_map(|record| validate_record(record))
}
