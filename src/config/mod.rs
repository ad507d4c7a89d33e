//! # Activity Engine Configuration
//!
//! Typed configuration for the engine, layered by [`ConfigManager`] from built-in
//! defaults, optional TOML files and `ACTIVITY_ENGINE__SECTION__KEY` environment
//! variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use activity_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let poll_interval = manager.config().engine.poll_interval();
//! let concurrency = manager.config().worker_pool.default_concurrency;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::defaults;

/// Root configuration structure mirroring `config/activity-engine.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ActivityEngineConfig {
    /// Drive loop, claiming and suspension settings
    pub engine: EngineConfig,

    /// Per-bucket worker pool sizing
    pub worker_pool: WorkerPoolConfig,

    /// Retry backoff for retryable item failures
    pub backoff: BackoffConfig,

    /// PostgreSQL task store connection
    pub database: DatabaseConfig,
}

/// Drive loop and claim protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of this execution node; recorded on claimed buckets and running tasks
    pub node_id: String,
    pub poll_interval_ms: u64,
    pub max_claim_attempts: u32,
    pub claim_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub auto_resume_delay_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4()),
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            max_claim_attempts: defaults::MAX_CLAIM_ATTEMPTS,
            claim_timeout_seconds: defaults::CLAIM_TIMEOUT_SECONDS,
            heartbeat_interval_seconds: defaults::HEARTBEAT_INTERVAL_SECONDS,
            auto_resume_delay_seconds: defaults::AUTO_RESUME_DELAY_SECONDS,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn auto_resume_delay(&self) -> Duration {
        Duration::from_secs(self.auto_resume_delay_seconds)
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Concurrency used when a work definition does not set its own
    pub default_concurrency: usize,
    /// Item queue capacity is `concurrency * queue_factor`
    pub queue_factor: usize,
    /// How many recent item failures are kept in statistics
    pub recent_failure_limit: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            default_concurrency: defaults::WORKER_CONCURRENCY,
            queue_factor: defaults::QUEUE_FACTOR,
            recent_failure_limit: defaults::RECENT_FAILURE_LIMIT,
        }
    }
}

/// Backoff and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_enabled: bool,
    /// Fraction of the computed delay applied as +/- jitter
    pub max_jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

/// Database connection configuration for `PgTaskStore`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    /// Connection URL, falling back to `DATABASE_URL`
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

impl ActivityEngineConfig {
    /// Validate the merged configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.engine.node_id.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "engine.node_id",
                "engine configuration",
            ));
        }

        if self.engine.max_claim_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.max_claim_attempts",
                0,
                "at least one claim attempt is required",
            ));
        }

        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.poll_interval_ms",
                0,
                "poll interval must be greater than 0",
            ));
        }

        if self.engine.heartbeat_interval_seconds >= self.engine.claim_timeout_seconds {
            return Err(ConfigurationError::invalid_value(
                "engine.heartbeat_interval_seconds",
                self.engine.heartbeat_interval_seconds,
                "heartbeat interval must be shorter than the claim timeout",
            ));
        }

        if self.worker_pool.default_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.default_concurrency",
                0,
                "concurrency must be greater than 0",
            ));
        }

        if self.worker_pool.queue_factor == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.queue_factor",
                0,
                "queue factor must be greater than 0",
            ));
        }

        if self.backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                self.backoff.multiplier,
                "multiplier must be at least 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.backoff.max_jitter) {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_jitter",
                self.backoff.max_jitter,
                "jitter must be within [0, 1]",
            ));
        }

        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_delay_ms",
                self.backoff.base_delay_ms,
                "base delay exceeds max delay",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                0,
                "pool size must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ActivityEngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.engine.node_id.starts_with("node-"));
        assert_eq!(config.engine.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = ActivityEngineConfig::default();
        config.worker_pool.default_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { field, .. }) if field == "worker_pool.default_concurrency"
        ));
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut config = ActivityEngineConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = ActivityEngineConfig::default();
        config.backoff.max_jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_claim_attempts_rejected() {
        let mut config = ActivityEngineConfig::default();
        config.engine.max_claim_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_claim_timeout() {
        let mut config = ActivityEngineConfig::default();
        config.engine.heartbeat_interval_seconds = config.engine.claim_timeout_seconds;
        assert!(config.validate().is_err());
    }
}
