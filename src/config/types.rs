//! Configuration types.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use super::ConfigError;
use crate::pipeline::{PipelineOptions, TracingLogger};

/// Pipeline configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline timeout in milliseconds. Zero disables it.
    pub timeout_ms: u64,
    /// Most verbose pipeline event level forwarded to the logger.
    pub log_level: String,
    /// Grace period in milliseconds before a terminate escalates to kill.
    pub terminate_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            log_level: "debug".to_string(),
            terminate_grace_ms: 2000,
        }
    }
}

impl PipelineConfig {
    /// Pipeline timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Terminate grace period.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Parse the configured log level.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidLogLevel` for unknown level names.
    pub fn level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
            value: self.log_level.clone(),
        })
    }

    /// Build pipeline options logging through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidLogLevel` for unknown level names.
    pub fn to_options(&self) -> Result<PipelineOptions, ConfigError> {
        Ok(PipelineOptions {
            timeout: self.timeout(),
            log_level: self.level()?,
            logger: Arc::new(TracingLogger),
            stop_token: None,
        })
    }
}
