//! Locating and reading the procpipe config file.
//!
//! A project-local `.procpipe.toml` wins over the per-user
//! `<config_dir>/procpipe/config.toml`. With neither present the built-in
//! defaults apply.

use std::path::{Path, PathBuf};

use super::PipelineConfig;

/// Name of the project-local config file.
const LOCAL_FILE: &str = ".procpipe.toml";

/// Finds and parses the pipeline config.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    candidates: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Look in the working directory, then in the user's config directory.
    #[must_use]
    pub fn new() -> Self {
        let user = dirs::config_dir().map(|dir| dir.join("procpipe").join("config.toml"));
        Self {
            candidates: std::iter::once(PathBuf::from(LOCAL_FILE))
                .chain(user)
                .collect(),
        }
    }

    /// Only consider `path`, as given with `--config`.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            candidates: vec![path],
        }
    }

    /// Parse the first candidate that exists, or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` or `ConfigError::ParseError` when the
    /// chosen file cannot be read or is not valid pipeline TOML.
    pub fn load(&self) -> Result<PipelineConfig, ConfigError> {
        let Some(path) = self.find_config_file() else {
            tracing::debug!(candidates = self.candidates.len(), "No pipeline config, using defaults");
            return Ok(PipelineConfig::default());
        };

        tracing::debug!(path = %path.display(), "Reading pipeline config");
        parse_file(&path)
    }

    /// Candidate files, highest priority first.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// The candidate that `load` would read, if any exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|path| path.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

/// Why the pipeline config could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read pipeline config {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid pipeline TOML.
    #[error("invalid pipeline config {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// `log_level` names no tracing level.
    #[error("unknown log level `{value}` (expected trace, debug, info, warn or error)")]
    InvalidLogLevel { value: String },
}
