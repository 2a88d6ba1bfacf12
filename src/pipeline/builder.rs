//! Pipeline preparation: validation and stdio wiring.

use super::capture::CaptureBuffer;
use super::command::Command;
use super::error::PipelineError;
use super::logger::{PipelineEvent, Wiring};
use super::stage::{Stage, StderrPlan, StdinPlan, StdoutPlan};

/// How the last stage's output is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    /// Use the caller's sinks, or the null device.
    Sink,
    /// Buffer stdout and stderr unless the caller supplied sinks.
    Capture,
    /// Expose the raw process handles.
    Stream,
}

/// Buffers installed on the last stage in capture mode.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub(crate) stdout: Option<CaptureBuffer>,
    pub(crate) stderr: Option<CaptureBuffer>,
}

/// Check stream placement for every stage, in order.
pub(crate) fn validate(commands: &[Command]) -> Result<(), PipelineError> {
    if commands.is_empty() {
        return Err(PipelineError::NoCommands);
    }

    let last = commands.len() - 1;
    for (index, command) in commands.iter().enumerate() {
        if command.spec().program().is_empty() {
            return Err(PipelineError::EmptyProgram { index });
        }
        if index != 0 && command.has_stdin() {
            return Err(PipelineError::InvalidStdinPlacement { index });
        }
        if index != last && command.has_stdout() {
            return Err(PipelineError::InvalidStdoutPlacement { index });
        }
    }

    Ok(())
}

/// Turn validated commands into runtime stages.
///
/// `emit` receives one [`PipelineEvent::StageWired`] per stage.
pub(crate) fn wire(
    commands: Vec<Command>,
    mode: OutputMode,
    mut emit: impl FnMut(PipelineEvent),
) -> (Vec<Stage>, Captured) {
    let total = commands.len();
    let mut captured = Captured::default();
    let mut stages = Vec::with_capacity(total);

    for (index, command) in commands.into_iter().enumerate() {
        let (spec, streams) = command.into_parts();
        let last = index + 1 == total;

        let stdin = if index == 0 {
            streams.stdin.map_or(StdinPlan::Null, StdinPlan::Source)
        } else {
            StdinPlan::Pipe
        };

        let stdout = match (last, mode, streams.stdout) {
            (false, ..) => StdoutPlan::Pipe,
            (true, _, Some(sink)) => StdoutPlan::Sink(sink, Wiring::Sink),
            (true, OutputMode::Stream, None) => StdoutPlan::Exposed,
            (true, OutputMode::Capture, None) => {
                let buffer = CaptureBuffer::new();
                captured.stdout = Some(buffer.clone());
                StdoutPlan::Sink(Box::new(buffer), Wiring::Capture)
            }
            (true, OutputMode::Sink, None) => StdoutPlan::Null,
        };

        let stderr = match (last, mode, streams.stderr) {
            (_, _, Some(sink)) => StderrPlan::Sink(sink, Wiring::Sink),
            (true, OutputMode::Capture, None) => {
                let buffer = CaptureBuffer::new();
                captured.stderr = Some(buffer.clone());
                StderrPlan::Sink(Box::new(buffer), Wiring::Capture)
            }
            (true, OutputMode::Stream, None) => StderrPlan::Exposed,
            (_, _, None) => StderrPlan::Null,
        };

        let stage = Stage::new(index, spec, stdin, stdout, stderr);
        let (stdin, stdout, stderr) = stage.wiring();
        emit(PipelineEvent::StageWired {
            index,
            total,
            command: stage.spec().to_string(),
            stdin,
            stdout,
            stderr,
        });
        stages.push(stage);
    }

    (stages, captured)
}
