//! Runtime configuration via `stm.toml`
//!
//! An `Stm` can be built fluently with [`StmBuilder`](crate::StmBuilder) or
//! from a TOML file. Every field is optional in the file; missing fields take
//! the same defaults as `StmConfig::default()`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_concurrency::{RetryConfig, TxnConfig, MAX_READONLY_STREAK};
use strata_core::IsolationLevel;
use thiserror::Error;

/// Config file name conventionally used for an STM runtime
pub const CONFIG_FILE_NAME: &str = "stm.toml";

/// Errors from loading or validating a runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("config file '{path}': {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The TOML could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Exponential backoff between conflict retries, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry; 0 yields the thread instead of sleeping
    #[serde(default)]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    10
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Runtime configuration loaded from `stm.toml`.
///
/// # Example
///
/// ```toml
/// isolation = "serializable"
/// max_retries = 200
/// timeout_ms = 500
///
/// [backoff]
/// base_delay_ms = 1
/// max_delay_ms = 20
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StmConfig {
    /// Consecutive read-only departures before a cell stops counting readers
    #[serde(default = "default_read_biased_threshold")]
    pub read_biased_threshold: u32,
    /// Bounded spins on a locked cell before reporting a conflict
    #[serde(default = "default_spin_count")]
    pub spin_count: u32,
    /// Attempt budget of the `atomic` driver
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Default isolation level: `"snapshot"` or `"serializable"`
    #[serde(default)]
    pub isolation: IsolationLevel,
    /// Whether `retry()` may park the calling thread
    #[serde(default = "default_true")]
    pub blocking_allowed: bool,
    /// Deadline for a blocked `atomic` call; absent means wait forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Skip writes whose value did not change
    #[serde(default = "default_true")]
    pub dirty_check: bool,
    /// Revalidate reads when another transaction signals a conflict
    #[serde(default = "default_true")]
    pub speculative_consistency: bool,
    /// Backoff between conflict retries
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_read_biased_threshold() -> u32 {
    strata_concurrency::DEFAULT_READ_BIASED_THRESHOLD
}

fn default_spin_count() -> u32 {
    64
}

fn default_max_retries() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            read_biased_threshold: default_read_biased_threshold(),
            spin_count: default_spin_count(),
            max_retries: default_max_retries(),
            isolation: IsolationLevel::default(),
            blocking_allowed: true,
            timeout_ms: None,
            dirty_check: true,
            speculative_consistency: true,
            backoff: BackoffConfig::default(),
        }
    }
}

impl StmConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Strata STM runtime configuration
#
# Isolation level: "snapshot" (default) or "serializable"
#   "snapshot"     = reads validated at commit, write skew possible
#   "serializable" = read records are read-locked at commit
isolation = "snapshot"

# Attempt budget for atomic() before it gives up with TooManyRetries
max_retries = 1000

# Spins on a locked cell before the access is reported as a conflict
spin_count = 64

# Read-only departures before a cell becomes read biased (1..=1023)
read_biased_threshold = 128

# Whether retry() may block the calling thread
blocking_allowed = true

# Deadline for a blocked atomic() call, in milliseconds
# timeout_ms = 1000

# Skip writes whose new value equals the old one
dirty_check = true

# Revalidate reads when another transaction signals a conflict
speculative_consistency = true

[backoff]
# 0 means yield instead of sleeping
base_delay_ms = 0
max_delay_ms = 10
"#
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_biased_threshold == 0 || self.read_biased_threshold > MAX_READONLY_STREAK {
            return Err(ConfigError::Invalid(format!(
                "read_biased_threshold must be in 1..={}, got {}",
                MAX_READONLY_STREAK, self.read_biased_threshold
            )));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "timeout_ms must be positive; omit it to wait forever".to_string(),
            ));
        }
        Ok(())
    }

    /// Deadline for blocked calls
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The per-transaction configuration this runtime hands out
    pub fn txn_config(&self) -> TxnConfig {
        let retry = RetryConfig::new()
            .with_max_retries(self.max_retries)
            .with_base_delay_ms(self.backoff.base_delay_ms)
            .with_max_delay_ms(self.backoff.max_delay_ms);
        let config = TxnConfig::new()
            .with_isolation_level(self.isolation)
            .with_blocking_allowed(self.blocking_allowed)
            .with_spin_count(self.spin_count)
            .with_dirty_check(self.dirty_check)
            .with_speculative_consistency(self.speculative_consistency)
            .with_read_biased_threshold(self.read_biased_threshold)
            .with_retry(retry);
        match self.timeout() {
            Some(timeout) => config.with_timeout(timeout),
            None => config,
        }
    }
}
