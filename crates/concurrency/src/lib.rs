//! Concurrency layer for Strata STM
//!
//! This crate implements the transactional memory engine:
//! - VersionedLock: packed lock word and version attached to every cell
//! - Cell / TxnRef: transactional cells and their typed handles
//! - Transaction: per-attempt record set with a two-phase commit
//! - Validation: read validation for prepare and speculative revalidation
//! - Listener chain and latch: wakeups for blocking retries
//! - TransactionManager: transaction id allocation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cell;
pub mod config;
pub mod conflict;
pub mod listener;
pub mod lock;
pub mod manager;
pub mod record;
pub mod reference;
pub mod transaction;
pub mod validation;

pub use cell::Cell;
pub use config::{RetryConfig, TxnConfig};
pub use conflict::{global_conflict_counter, GlobalConflictCounter};
pub use listener::{Latch, Listener, ListenerChain};
pub use lock::{
    Arrival, Departure, LockFailure, LockGrant, LockWord, VersionedLock,
    DEFAULT_READ_BIASED_THRESHOLD, MAX_READONLY_STREAK,
};
pub use manager::TransactionManager;
pub use record::{CommuteFn, Tranlocal, TxnValue};
pub use reference::{guard, retry, unwrap_or_retry, TxnRef, ATOMIC_SPIN_COUNT};
pub use transaction::{Transaction, TransactionStatus};
