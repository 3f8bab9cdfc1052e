//! Error types for the STM
//!
//! This module defines the error taxonomy shared by every layer.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into three classes:
//! - **Retriable**: `Conflict`. The retry driver re-runs the transaction body.
//! - **Control**: `Retry`. Consumed by the driver, which parks the thread
//!   until a cell the transaction read changes.
//! - **Terminal**: everything else. Surfaced to the caller unchanged.

use crate::types::{CellId, LockMode, TxnId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for STM operations
pub type StmResult<T> = std::result::Result<T, StmError>;

/// Why a transaction lost a race
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A cell read at one version was found at another version
    ReadWrite {
        /// The cell that changed
        cell: CellId,
        /// Version recorded when the transaction read the cell
        read_version: u64,
        /// Version found during validation
        current_version: u64,
    },
    /// A lock could not be acquired because another party holds one
    LockDenied {
        /// The cell whose lock was denied
        cell: CellId,
        /// Mode that was requested
        requested: LockMode,
    },
    /// A cell is exclusively locked by another transaction
    ExclusivelyLocked {
        /// The locked cell
        cell: CellId,
    },
}

impl ConflictKind {
    /// Cell on which the conflict was detected
    pub fn cell(&self) -> CellId {
        match self {
            ConflictKind::ReadWrite { cell, .. }
            | ConflictKind::LockDenied { cell, .. }
            | ConflictKind::ExclusivelyLocked { cell } => *cell,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::ReadWrite {
                cell,
                read_version,
                current_version,
            } => write!(
                f,
                "read-write conflict on {}: read version {}, found {}",
                cell, read_version, current_version
            ),
            ConflictKind::LockDenied { cell, requested } => {
                write!(f, "{} lock denied on {}", requested, cell)
            }
            ConflictKind::ExclusivelyLocked { cell } => {
                write!(f, "{} is exclusively locked", cell)
            }
        }
    }
}

/// Error types for the STM
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StmError {
    /// Transaction lost a read-write or write-write race
    #[error("{txn_id} aborted: {conflict}")]
    Conflict {
        /// Attempt that lost
        txn_id: TxnId,
        /// What was detected
        conflict: ConflictKind,
    },

    /// A transaction-free operation found the cell locked
    #[error("{cell} is locked by another transaction")]
    Locked {
        /// The locked cell
        cell: CellId,
    },

    /// Operation attempted on a committed or aborted transaction
    #[error("{txn_id} is not active: {status}")]
    DeadTransaction {
        /// The dead transaction
        txn_id: TxnId,
        /// Terminal status it was found in
        status: String,
    },

    /// Mutating operation attempted after `prepare()`
    #[error("{txn_id} is prepared and no longer accepts operations")]
    PreparedTransaction {
        /// The prepared transaction
        txn_id: TxnId,
    },

    /// Control signal: block until a read cell changes, then re-run
    #[error("transaction requested a blocking retry")]
    Retry,

    /// Blocking retry requested but the configuration forbids it
    #[error("{txn_id} requested a retry but blocking is not allowed")]
    RetryNotAllowed {
        /// The transaction that asked to block
        txn_id: TxnId,
    },

    /// Blocking retry requested but nothing was read to wait on
    #[error("{txn_id} requested a retry without reading any cell")]
    NoRetryPossible {
        /// The transaction that asked to block
        txn_id: TxnId,
    },

    /// Blocking retry deadline passed
    #[error("{txn_id} timed out after {waited:?}")]
    Timeout {
        /// The transaction that was waiting
        txn_id: TxnId,
        /// How long it waited in total
        waited: Duration,
    },

    /// Retry budget exhausted
    #[error("gave up after {attempts} attempts: {last}")]
    TooManyRetries {
        /// Number of attempts made
        attempts: usize,
        /// Error from the final attempt
        last: Box<StmError>,
    },

    /// Write attempted in a read-only transaction
    #[error("{txn_id} is read-only")]
    ReadonlyViolation {
        /// The read-only transaction
        txn_id: TxnId,
    },

    /// Cell was constructed by a transaction that aborted
    #[error("{cell} was never published: its constructing transaction aborted")]
    PoisonedCell {
        /// The poisoned cell
        cell: CellId,
    },

    /// Transaction body aborted explicitly
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Human-readable reason
        reason: String,
    },
}

impl StmError {
    /// Build a conflict error for the given attempt
    pub fn conflict(txn_id: TxnId, conflict: ConflictKind) -> Self {
        StmError::Conflict { txn_id, conflict }
    }

    /// Build an explicit abort error
    pub fn aborted(reason: impl Into<String>) -> Self {
        StmError::Aborted {
            reason: reason.into(),
        }
    }

    /// True for conflicts, which the retry driver re-runs
    pub fn is_conflict(&self) -> bool {
        matches!(self, StmError::Conflict { .. })
    }

    /// True for the blocking-retry control signal
    pub fn is_retry(&self) -> bool {
        matches!(self, StmError::Retry)
    }

    /// True for errors indicating misuse of the API
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            StmError::DeadTransaction { .. }
                | StmError::PreparedTransaction { .. }
                | StmError::ReadonlyViolation { .. }
                | StmError::PoisonedCell { .. }
        )
    }
}

/// Access the STM error carried by an application error type
///
/// The retry driver needs to tell conflicts and retry signals apart from
/// application failures. Application error types that wrap `StmError`
/// implement this trait so the driver can look inside them; everything the
/// driver does not recognise is propagated unchanged.
pub trait AsStmError {
    /// The wrapped STM error, if this value carries one
    fn as_stm_error(&self) -> Option<&StmError>;
}

impl AsStmError for StmError {
    fn as_stm_error(&self) -> Option<&StmError> {
        Some(self)
    }
}
