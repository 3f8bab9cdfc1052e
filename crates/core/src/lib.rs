//! Core types for Strata STM
//!
//! This crate defines the foundational types used throughout the system:
//! - CellId / TxnId: identities of cells and transaction attempts
//! - LockMode: the ordered lock modes of a cell's lock word
//! - IsolationLevel: Snapshot vs Serializable commit validation
//! - StmError: the error taxonomy (conflicts, control signals, misuse)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{AsStmError, ConflictKind, StmError, StmResult};
pub use types::{CellId, IsolationLevel, LockMode, TxnId};
