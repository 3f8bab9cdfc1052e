//! Strata STM - software transactional memory for Rust
//!
//! Shared state lives in transactional cells ([`TxnRef`]). Threads read and
//! write them inside transactions that commit atomically or not at all;
//! conflicting transactions are detected and re-run, and a transaction can
//! block with `retry()` until something it read changes.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_stm::{Stm, TxnRef};
//!
//! let stm = Stm::new();
//! let from = TxnRef::new(100i64);
//! let to = TxnRef::new(0i64);
//!
//! stm.atomic(|tx| {
//!     let amount = 30;
//!     from.alter(tx, |balance| balance - amount)?;
//!     to.alter(tx, |balance| balance + amount)?;
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: identifiers, lock modes, isolation levels, errors
//! - `strata-concurrency`: lock words, cells, transactions, commit protocol
//! - `strata-engine`: the `Stm` runtime, configuration, metrics

pub use strata_concurrency::{
    guard, retry, unwrap_or_retry, Cell, RetryConfig, Transaction, TransactionStatus, TxnConfig,
    TxnRef, TxnValue,
};
pub use strata_core::{
    AsStmError, CellId, ConflictKind, IsolationLevel, LockMode, StmError, StmResult, TxnId,
};
pub use strata_engine::{
    atomic, default_stm, reset_default, set_default, BackoffConfig, ConfigError, Stm, StmBuilder,
    StmConfig, TransactionMetrics,
};
