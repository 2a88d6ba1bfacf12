//! Pipeline event logging.
//!
//! The pipeline never logs on its own; it reports [`PipelineEvent`]s to the
//! [`PipelineLogger`] injected through the options. The default logger drops
//! everything, [`TracingLogger`] forwards to `tracing`.

use std::fmt;
use std::time::Duration;

use tracing::Level;

use super::exit::ExitReport;

/// Where one stdio stream of a stage is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wiring {
    /// The null device.
    Null,
    /// A caller-supplied input source.
    Source,
    /// A caller-supplied output sink.
    Sink,
    /// An internal capture buffer.
    Capture,
    /// The raw process handle, exposed to the caller.
    Exposed,
    /// Read from the previous stage through a pipe link.
    FromStage(usize),
    /// Written to the next stage through a pipe link.
    ToStage(usize),
}

impl fmt::Display for Wiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Source => f.write_str("source"),
            Self::Sink => f.write_str("sink"),
            Self::Capture => f.write_str("capture"),
            Self::Exposed => f.write_str("exposed"),
            Self::FromStage(index) => write!(f, "pipe<-{index}"),
            Self::ToStage(index) => write!(f, "pipe->{index}"),
        }
    }
}

/// Something the pipeline did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The pipeline is being prepared.
    Preparing { pipeline: String, stages: usize },
    /// A stage's stdio has been resolved.
    StageWired {
        index: usize,
        total: usize,
        command: String,
        stdin: Wiring,
        stdout: Wiring,
        stderr: Wiring,
    },
    /// A stage is about to be spawned.
    StageStarting {
        index: usize,
        total: usize,
        command: String,
    },
    /// The controller is waiting on a stage.
    StageWaiting {
        index: usize,
        total: usize,
        command: String,
    },
    /// A stage has been reaped.
    StageExited {
        index: usize,
        total: usize,
        report: ExitReport,
    },
    /// A pipe link finished relaying.
    LinkDrained { index: usize, bytes: u64 },
    /// Kill was requested.
    KillRequested,
    /// Graceful termination was requested.
    TerminateRequested { grace: Duration },
    /// Cancel was requested.
    CancelRequested,
    /// The pipeline deadline expired.
    TimedOut { timeout: Duration },
    /// An external stop notification fired.
    ExternalStop,
    /// The pipeline released its resources.
    Closed,
}

impl PipelineEvent {
    /// Level this event is reported at.
    #[must_use]
    pub fn level(&self) -> Level {
        match self {
            Self::Preparing { .. }
            | Self::KillRequested
            | Self::TerminateRequested { .. }
            | Self::CancelRequested
            | Self::TimedOut { .. }
            | Self::ExternalStop => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Sink for pipeline events.
pub trait PipelineLogger: Send + Sync {
    /// Record one event.
    fn log(&self, event: &PipelineEvent);
}

/// Logger that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl PipelineLogger for NoopLogger {
    fn log(&self, _event: &PipelineEvent) {}
}

/// Logger forwarding events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl PipelineLogger for TracingLogger {
    fn log(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Preparing { pipeline, stages } => {
                tracing::debug!(%pipeline, stages, "Executing pipeline");
            }
            PipelineEvent::StageWired {
                index,
                total,
                command,
                stdin,
                stdout,
                stderr,
            } => {
                tracing::trace!(
                    index,
                    total,
                    %command,
                    %stdin,
                    %stdout,
                    %stderr,
                    "Prepared stage"
                );
            }
            PipelineEvent::StageStarting {
                index,
                total,
                command,
            } => {
                tracing::trace!(index, total, %command, "Starting stage");
            }
            PipelineEvent::StageWaiting {
                index,
                total,
                command,
            } => {
                tracing::trace!(index, total, %command, "Waiting on stage");
            }
            PipelineEvent::StageExited {
                index,
                total,
                report,
            } => {
                tracing::trace!(index, total, code = report.code, %report, "Stage exited");
            }
            PipelineEvent::LinkDrained { index, bytes } => {
                tracing::trace!(index, bytes, "Pipe link drained");
            }
            PipelineEvent::KillRequested => tracing::debug!("Killing pipeline"),
            PipelineEvent::TerminateRequested { grace } => {
                tracing::debug!(?grace, "Terminating pipeline");
            }
            PipelineEvent::CancelRequested => tracing::debug!("Cancelling pipeline"),
            PipelineEvent::TimedOut { timeout } => {
                tracing::debug!(?timeout, "Pipeline deadline expired");
            }
            PipelineEvent::ExternalStop => tracing::debug!("External stop received"),
            PipelineEvent::Closed => tracing::trace!("Pipeline closed"),
        }
    }
}
