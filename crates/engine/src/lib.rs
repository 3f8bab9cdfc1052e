//! STM runtime for Strata
//!
//! This crate sits on top of `strata-concurrency` and provides:
//! - `Stm`: the runtime that drives transactions (`atomic`) with conflict
//!   retry, backoff and blocking retry
//! - Configuration from `stm.toml` or a fluent builder
//! - Transaction metrics
//! - A process-wide default runtime for code without an explicit `Stm`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod registry;
pub mod stm;

pub use builder::StmBuilder;
pub use config::{BackoffConfig, ConfigError, StmConfig, CONFIG_FILE_NAME};
pub use coordinator::{TransactionCoordinator, TransactionMetrics};
pub use registry::{atomic, default_stm, reset_default, set_default};
pub use stm::Stm;
