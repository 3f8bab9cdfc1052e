//! Identifiers and lock vocabulary shared by every layer
//!
//! This module defines the small value types the rest of the system is
//! built from:
//! - CellId: process-unique identity of a transactional cell
//! - TxnId: identity of one transaction attempt
//! - LockMode: the four ordered lock modes of a cell's lock word
//! - IsolationLevel: Snapshot vs Serializable commit validation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transactional cell
///
/// Allocated once when a cell is created and never reused within a process.
/// Transactions key their working-copy records by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        CellId(raw)
    }

    /// Raw numeric id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Unique identifier for a transaction attempt
///
/// Every attempt made by the retry driver gets a fresh id, so a conflict
/// error always names the attempt that lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        TxnId(raw)
    }

    /// Raw numeric id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Lock mode held on (or requested for) a cell
///
/// Modes are totally ordered: `None < Read < Write < Exclusive`.
///
/// | Mode | Other readers | Other writers |
/// |------|---------------|---------------|
/// | `None` | allowed | allowed |
/// | `Read` | allowed (shared) | excluded |
/// | `Write` | allowed (see last committed value) | excluded |
/// | `Exclusive` | excluded | excluded |
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// No lock
    #[default]
    None = 0,
    /// Shared lock, held by any number of transactions
    Read = 1,
    /// Single-owner lock excluding other writers
    Write = 2,
    /// Single-owner lock excluding readers and writers
    Exclusive = 3,
}

impl LockMode {
    /// Numeric encoding used in the packed lock word
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode from the packed lock word encoding
    pub const fn from_u8(raw: u8) -> Option<LockMode> {
        match raw {
            0 => Some(LockMode::None),
            1 => Some(LockMode::Read),
            2 => Some(LockMode::Write),
            3 => Some(LockMode::Exclusive),
            _ => None,
        }
    }

    /// True if this mode prevents other transactions from writing
    pub const fn excludes_writers(self) -> bool {
        !matches!(self, LockMode::None)
    }

    /// True if this mode prevents other transactions from reading
    pub const fn excludes_readers(self) -> bool {
        matches!(self, LockMode::Exclusive)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

/// Isolation level applied when a transaction commits
///
/// - `Snapshot`: reads are checked for staleness when the transaction
///   prepares. Write-skew is possible when two prepare windows overlap.
/// - `Serializable`: every read of an updating transaction is read-locked
///   during prepare, so no other transaction can commit a write to it
///   before this one finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Snapshot isolation (write-skew allowed)
    #[default]
    Snapshot,
    /// Serializable isolation (write-skew prevented)
    Serializable,
}

impl IsolationLevel {
    /// Whether this level tolerates the write-skew anomaly
    pub const fn allows_write_skew(self) -> bool {
        matches!(self, IsolationLevel::Snapshot)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Snapshot => f.write_str("snapshot"),
            IsolationLevel::Serializable => f.write_str("serializable"),
        }
    }
}
