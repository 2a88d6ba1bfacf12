//! Pipeline error types.

use std::time::Duration;

use super::exit::ExitReport;

/// Error type for spawning a single stage.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The program was not found.
    #[error("program not found: {program}")]
    NotFound { program: String },
    /// Permission denied when spawning.
    #[error("permission denied: {program}")]
    PermissionDenied { program: String },
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    pub(crate) fn from_io(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program: program.to_string(),
            },
            _ => Self::Io(err),
        }
    }
}

/// Broad classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The pipeline description is invalid. Never retried.
    Validation,
    /// An operation was invoked in the wrong lifecycle state.
    State,
    /// A process could not be created.
    Spawn,
    /// A process ran and disagreed: non-zero exit, signal, timeout or broken I/O.
    Execution,
}

/// Errors produced while preparing or driving a pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// No commands were supplied.
    #[error("at least one command is required")]
    NoCommands,

    /// An input source was attached to a stage other than the first.
    #[error("stdin allowed only for the first command (stage {index})")]
    InvalidStdinPlacement { index: usize },

    /// An output sink was attached to a stage other than the last.
    #[error("stdout allowed only for the last command (stage {index})")]
    InvalidStdoutPlacement { index: usize },

    /// A stage has an empty program name.
    #[error("empty program name (stage {index})")]
    EmptyProgram { index: usize },

    /// The pipeline was already started or has exited.
    #[error("process already started")]
    AlreadyStarted,

    /// The pipeline was never started or has already exited.
    #[error("process not started")]
    NotStarted,

    /// A stage failed to spawn.
    #[error("failed to spawn stage {index} `{command}`: {source}")]
    Spawn {
        index: usize,
        command: String,
        #[source]
        source: SpawnError,
    },

    /// A stage exited unsuccessfully or was terminated by a signal.
    #[error("stage {index} `{command}` {report}")]
    StageFailed {
        index: usize,
        command: String,
        report: ExitReport,
    },

    /// The pipeline deadline expired before every stage finished.
    #[error("pipeline timed out after {timeout:?}: {report}")]
    TimedOut { timeout: Duration, report: ExitReport },

    /// Waiting on a stage or draining its streams failed.
    #[error("I/O error on stage {index} `{command}`: {source}")]
    StageIo {
        index: usize,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCommands
            | Self::InvalidStdinPlacement { .. }
            | Self::InvalidStdoutPlacement { .. }
            | Self::EmptyProgram { .. } => ErrorKind::Validation,
            Self::AlreadyStarted | Self::NotStarted => ErrorKind::State,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::StageFailed { .. } | Self::TimedOut { .. } | Self::StageIo { .. } => {
                ErrorKind::Execution
            }
        }
    }

    /// The exit report of the stage that failed, if a stage ran to completion.
    #[must_use]
    pub fn report(&self) -> Option<&ExitReport> {
        match self {
            Self::StageFailed { report, .. } | Self::TimedOut { report, .. } => Some(report),
            _ => None,
        }
    }

    /// The reconciled exit code of the failing stage, if any.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.report().map(|report| report.code)
    }

    /// Consume the error and return the failing stage's report.
    ///
    /// # Errors
    ///
    /// Gives the error back when no stage ran to completion.
    pub fn into_report(self) -> Result<ExitReport, Self> {
        match self {
            Self::StageFailed { report, .. } | Self::TimedOut { report, .. } => Ok(report),
            other => Err(other),
        }
    }
}
