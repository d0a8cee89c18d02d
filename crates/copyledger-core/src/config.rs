// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration management for copyledger.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default backoff window between attempts on the same record (24 hours).
pub const DEFAULT_BACKOFF_SECS: u64 = 24 * 60 * 60;

/// [`DEFAULT_BACKOFF_SECS`] as a `Duration`.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(DEFAULT_BACKOFF_SECS);

/// Default time a plain update waits for a row held by another transaction.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default number of concurrent replication workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default sleep between claims when no work is available.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default limit on a single upload to one target.
pub const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Ledger storage configuration.
    pub ledger: LedgerConfig,
    /// Replication worker configuration.
    pub worker: WorkerConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.ledger.validate()?;
        self.worker.validate()
    }
}

/// How commits are flushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// fsync on every commit.
    #[default]
    Always,
    /// Let the store batch flushes. A crash may lose recent commits.
    None,
}

/// Ledger storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Path of the ledger database file.
    pub path: PathBuf,
    /// Commit durability.
    pub sync: SyncStrategy,
    /// Minimum seconds between attempts on the same record.
    pub backoff_secs: u64,
    /// Milliseconds a plain update waits for a row held by another transaction.
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/copyledger.redb"),
            sync: SyncStrategy::Always,
            backoff_secs: DEFAULT_BACKOFF_SECS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl LedgerConfig {
    /// Creates a ledger configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the database path.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the commit durability.
    pub fn sync(mut self, sync: SyncStrategy) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the backoff window.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff_secs = backoff.as_secs();
        self
    }

    /// Sets the row lock wait limit.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the backoff window as a Duration.
    pub fn backoff_duration(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    /// Returns the lock wait limit as a Duration.
    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.backoff_secs == 0 {
            return Err(ConfigValidationError::InvalidBackoff);
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidLockTimeout);
        }
        Ok(())
    }
}

/// Replication worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Milliseconds to sleep after a claim finds no work.
    pub poll_interval_ms: u64,
    /// Milliseconds allowed for one upload to one target.
    pub upload_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            upload_timeout_ms: DEFAULT_UPLOAD_TIMEOUT_MS,
        }
    }
}

impl WorkerConfig {
    /// Creates a worker configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the per-upload timeout.
    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the idle poll interval as a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the per-upload timeout as a Duration.
    pub fn upload_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.workers == 0 {
            return Err(ConfigValidationError::InvalidWorkerCount);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidPollInterval);
        }
        if self.upload_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidUploadTimeout);
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Errors from configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    /// Backoff must be positive.
    #[error("backoff must be positive")]
    InvalidBackoff,

    /// Lock timeout must be positive.
    #[error("lock timeout must be positive")]
    InvalidLockTimeout,

    /// At least one worker is required.
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,

    /// Poll interval must be positive.
    #[error("poll interval must be positive")]
    InvalidPollInterval,

    /// Upload timeout must be positive.
    #[error("upload timeout must be positive")]
    InvalidUploadTimeout,
}
