//! # Engine Configuration
//!
//! Typed configuration for the background processing engine. Every field has a
//! default, so an empty source yields a usable configuration; [`ConfigManager`]
//! layers files and environment variables on top.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use processing_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let threads = manager.config().processing_thread_count;
//! let timeout = manager.config().lock_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration for one engine instance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of `process()` calls allowed to run concurrently
    pub processing_thread_count: usize,
    /// Claimed objects allowed to wait for a worker
    pub maximum_queue_length: usize,
    /// Attempt budget for processors that do not define their own
    pub max_processing_attempts: i32,
    pub polling_interval_ms: u64,
    pub stale_lock_sweep_interval_seconds: u64,
    /// Age after which a processing lock is presumed orphaned
    pub lock_timeout_seconds: u64,
    /// Advisory bound for callers waiting on processing; never enforced on workers
    pub processing_timeout_millis: u64,
    pub shutdown_timeout_ms: u64,
    pub backoff: BackoffConfig,
    pub database: DatabaseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processing_thread_count: 4,
            maximum_queue_length: 16,
            max_processing_attempts: 3,
            polling_interval_ms: 1000,
            stale_lock_sweep_interval_seconds: 60,
            lock_timeout_seconds: 300,
            processing_timeout_millis: 30_000,
            shutdown_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Upper bound on objects held by the engine at once (active + queued)
    pub fn capacity(&self) -> usize {
        self.processing_thread_count + self.maximum_queue_length
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn stale_lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_lock_sweep_interval_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.processing_thread_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "processing_thread_count",
                "0",
                "at least one worker is required",
            ));
        }
        if self.max_processing_attempts < 1 {
            return Err(ConfigurationError::invalid_value(
                "max_processing_attempts",
                self.max_processing_attempts.to_string(),
                "must allow at least one attempt",
            ));
        }
        if self.polling_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "polling_interval_ms",
                "0",
                "must be positive",
            ));
        }
        if self.stale_lock_sweep_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "stale_lock_sweep_interval_seconds",
                "0",
                "must be positive",
            ));
        }
        if self.lock_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "lock_timeout_seconds",
                "0",
                "must be positive",
            ));
        }
        self.backoff.validate()?;
        self.database.validate()
    }
}

/// Exponential backoff applied by the default retry policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the computed delay (0.0 - 1.0)
    pub jitter_max_percentage: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5 minutes
            multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_percentage: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                self.multiplier.to_string(),
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_max_percentage) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_max_percentage",
                self.jitter_max_percentage.to_string(),
                "must be between 0.0 and 1.0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_delay_ms",
                self.max_delay_ms.to_string(),
                "must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Connection settings for the PostgreSQL store
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit URL; falls back to `DATABASE_URL`
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL from configuration or the environment
    pub fn database_url(&self) -> ConfigResult<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or_else(|| {
                ConfigurationError::database_config_error(
                    "no database.url configured and DATABASE_URL is not set",
                )
            })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.max_connections.to_string(),
                "must be positive and not below min_connections",
            ));
        }
        Ok(())
    }
}
