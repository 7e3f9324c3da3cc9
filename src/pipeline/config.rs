//! Orchestrator configuration.
//!
//! This module provides configuration for the pipeline orchestrator:
//! state directory layout, checksum algorithm, conflict-retry bounds, and
//! step execution limits. Values come from defaults, the builder methods,
//! or `RUNFORGE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::checksum::ChecksumAlgorithm;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding state records and the run lock.
    pub state_dir: PathBuf,
    /// Default checksum algorithm for artifact fingerprints.
    pub checksum_algorithm: ChecksumAlgorithm,
    /// How many times a conflicted state write is retried with a fresh
    /// read before surfacing as fatal.
    pub max_conflict_retries: u32,
    /// Optional wall-clock limit for a single step's command.
    pub step_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".runforge/state"),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            max_conflict_retries: 3,
            step_timeout: None,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Sets the default checksum algorithm.
    pub fn with_checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = algorithm;
        self
    }

    /// Sets the conflict-retry bound.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Sets the per-step timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RUNFORGE_STATE_DIR`: state directory (default: .runforge/state)
    /// - `RUNFORGE_CHECKSUM_ALGORITHM`: sha256 or sha512 (default: sha256)
    /// - `RUNFORGE_MAX_CONFLICT_RETRIES`: conflict-retry bound (default: 3)
    /// - `RUNFORGE_STEP_TIMEOUT_SECS`: per-step timeout in seconds
    ///   (default: none)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RUNFORGE_STATE_DIR") {
            config.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("RUNFORGE_CHECKSUM_ALGORITHM") {
            config.checksum_algorithm =
                val.parse().map_err(|message| ConfigError::InvalidValue {
                    key: "RUNFORGE_CHECKSUM_ALGORITHM".to_string(),
                    message,
                })?;
        }

        if let Ok(val) = std::env::var("RUNFORGE_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = val.parse().map_err(|e| ConfigError::InvalidValue {
                key: "RUNFORGE_MAX_CONFLICT_RETRIES".to_string(),
                message: format!("{e}"),
            })?;
        }

        if let Ok(val) = std::env::var("RUNFORGE_STEP_TIMEOUT_SECS") {
            let secs: u64 = val.parse().map_err(|e| ConfigError::InvalidValue {
                key: "RUNFORGE_STEP_TIMEOUT_SECS".to_string(),
                message: format!("{e}"),
            })?;
            config.step_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "state_dir must not be empty".to_string(),
            ));
        }
        if let Some(timeout) = self.step_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(
                    "step_timeout must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
