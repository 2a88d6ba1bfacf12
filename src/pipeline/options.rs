//! Pipeline options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Level;

use super::logger::{NoopLogger, PipelineLogger};

/// Options shared by every stage of a pipeline.
#[derive(Clone)]
pub struct PipelineOptions {
    /// Deadline for the whole pipeline, measured from preparation. Zero means none.
    pub timeout: Duration,
    /// Most verbose event level forwarded to the logger.
    pub log_level: Level,
    /// Event sink.
    pub logger: Arc<dyn PipelineLogger>,
    /// External stop notification, registered when the pipeline starts.
    pub stop_token: Option<CancellationToken>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            log_level: Level::DEBUG,
            logger: Arc::new(NoopLogger),
            stop_token: None,
        }
    }
}

impl PipelineOptions {
    /// Create options with no timeout and a no-op logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pipeline timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the most verbose level forwarded to the logger.
    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Set the event sink.
    #[must_use]
    pub fn with_logger(mut self, logger: impl PipelineLogger + 'static) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Kill the pipeline when `token` is cancelled.
    #[must_use]
    pub fn with_stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = Some(token);
        self
    }

    /// The timeout, if one is configured.
    #[must_use]
    pub fn effective_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("timeout", &self.timeout)
            .field("log_level", &self.log_level)
            .field("stop_token", &self.stop_token.is_some())
            .finish_non_exhaustive()
    }
}
