//! Builder for fluent runtime configuration

use std::time::Duration;

use strata_core::IsolationLevel;

use crate::config::{ConfigError, StmConfig};
use crate::stm::Stm;

// ============================================================================
// Stm Builder Pattern
// ============================================================================

/// Builder for an [`Stm`] runtime
///
/// ```ignore
/// use strata_engine::Stm;
///
/// // 1. Defaults
/// let stm = Stm::new();
///
/// // 2. Builder
/// let stm = Stm::builder()
///     .serializable()
///     .max_retries(100)
///     .timeout(Duration::from_millis(500))
///     .build()?;
///
/// // 3. Config file
/// let stm = Stm::from_config_file(Path::new("stm.toml"))?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct StmBuilder {
    config: StmConfig,
}

impl StmBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config
    pub fn from_config(config: StmConfig) -> Self {
        Self { config }
    }

    /// Set the default isolation level
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.config.isolation = level;
        self
    }

    /// Shorthand for `isolation_level(IsolationLevel::Serializable)`
    pub fn serializable(self) -> Self {
        self.isolation_level(IsolationLevel::Serializable)
    }

    /// Attempt budget of `atomic`
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Spins on a locked cell before reporting a conflict
    pub fn spin_count(mut self, spin_count: u32) -> Self {
        self.config.spin_count = spin_count;
        self
    }

    /// Read-only departures before a cell becomes read biased
    pub fn read_biased_threshold(mut self, threshold: u32) -> Self {
        self.config.read_biased_threshold = threshold;
        self
    }

    /// Whether `retry()` may park the calling thread
    pub fn blocking_allowed(mut self, allowed: bool) -> Self {
        self.config.blocking_allowed = allowed;
        self
    }

    /// Deadline for blocked `atomic` calls
    ///
    /// Sub-millisecond durations round up to one millisecond.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some((timeout.as_millis() as u64).max(1));
        self
    }

    /// Skip writes whose value did not change
    pub fn dirty_check(mut self, enabled: bool) -> Self {
        self.config.dirty_check = enabled;
        self
    }

    /// Revalidate reads when another transaction signals a conflict
    pub fn speculative_consistency(mut self, enabled: bool) -> Self {
        self.config.speculative_consistency = enabled;
        self
    }

    /// Exponential backoff between conflict retries
    pub fn backoff(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.config.backoff.base_delay_ms = base_delay_ms;
        self.config.backoff.max_delay_ms = max_delay_ms;
        self
    }

    /// The config this builder would build with
    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Validate and build the runtime
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a value is out of range.
    pub fn build(self) -> Result<Stm, ConfigError> {
        Stm::from_config(&self.config)
    }
}
