//! Runtime state of one pipeline stage.
//!
//! A [`Stage`] is created at prepare time from a [`CommandSpec`] and the
//! stream plan the builder resolved for it. Spawning hands the child to a
//! supervisor task that races the child's exit against the stage's kill
//! token, then drains any sink pumps before reporting.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::command::{CommandSpec, InputSource, OutputSink};
use super::controller::Shared;
use super::error::SpawnError;
use super::logger::Wiring;

/// How stdin is bound.
pub(crate) enum StdinPlan {
    Null,
    Source(InputSource),
    Pipe,
}

/// How stdout is bound.
pub(crate) enum StdoutPlan {
    Null,
    Sink(OutputSink, Wiring),
    Pipe,
    Exposed,
}

/// How stderr is bound.
pub(crate) enum StderrPlan {
    Null,
    Sink(OutputSink, Wiring),
    Exposed,
}

impl StdinPlan {
    pub(crate) fn wiring(&self, index: usize) -> Wiring {
        match self {
            Self::Null => Wiring::Null,
            Self::Source(_) => Wiring::Source,
            Self::Pipe => Wiring::FromStage(index.saturating_sub(1)),
        }
    }

    fn stdio(&self) -> Stdio {
        match self {
            Self::Null => Stdio::null(),
            Self::Source(_) | Self::Pipe => Stdio::piped(),
        }
    }
}

impl StdoutPlan {
    pub(crate) fn wiring(&self, index: usize) -> Wiring {
        match self {
            Self::Null => Wiring::Null,
            Self::Sink(_, wiring) => *wiring,
            Self::Pipe => Wiring::ToStage(index + 1),
            Self::Exposed => Wiring::Exposed,
        }
    }

    fn stdio(&self) -> Stdio {
        match self {
            Self::Null => Stdio::null(),
            Self::Sink(..) | Self::Pipe | Self::Exposed => Stdio::piped(),
        }
    }
}

impl StderrPlan {
    pub(crate) fn wiring(&self) -> Wiring {
        match self {
            Self::Null => Wiring::Null,
            Self::Sink(_, wiring) => *wiring,
            Self::Exposed => Wiring::Exposed,
        }
    }

    fn stdio(&self) -> Stdio {
        match self {
            Self::Null => Stdio::null(),
            Self::Sink(..) | Self::Exposed => Stdio::piped(),
        }
    }
}

/// Handles the controller needs after a stage is spawned.
#[derive(Debug, Default)]
pub(crate) struct SpawnedIo {
    /// Read end of the link from the previous stage.
    pub(crate) link_stdin: Option<ChildStdin>,
    /// Write end of the link to the next stage.
    pub(crate) link_stdout: Option<ChildStdout>,
    pub(crate) exposed_stdout: Option<ChildStdout>,
    pub(crate) exposed_stderr: Option<ChildStderr>,
}

/// Task copying a caller's input source into stage 0.
struct Feed {
    task: JoinHandle<()>,
    failure: oneshot::Receiver<io::Error>,
}

/// Outcome of a supervised stage.
#[derive(Debug)]
pub(crate) struct StageExit {
    pub(crate) status: io::Result<ExitStatus>,
    /// First failure while draining the stage's sinks.
    pub(crate) io_error: Option<io::Error>,
}

pub(crate) struct Stage {
    index: usize,
    spec: CommandSpec,
    stdin: Option<StdinPlan>,
    stdout: Option<StdoutPlan>,
    stderr: Option<StderrPlan>,
    task: Option<JoinHandle<StageExit>>,
    exit_code: Option<i32>,
}

impl Stage {
    pub(crate) fn new(
        index: usize,
        spec: CommandSpec,
        stdin: StdinPlan,
        stdout: StdoutPlan,
        stderr: StderrPlan,
    ) -> Self {
        Self {
            index,
            spec,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            task: None,
            exit_code: None,
        }
    }

    pub(crate) fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    /// Resolved wiring as (stdin, stdout, stderr).
    pub(crate) fn wiring(&self) -> (Wiring, Wiring, Wiring) {
        (
            self.stdin
                .as_ref()
                .map_or(Wiring::Null, |plan| plan.wiring(self.index)),
            self.stdout
                .as_ref()
                .map_or(Wiring::Null, |plan| plan.wiring(self.index)),
            self.stderr.as_ref().map_or(Wiring::Null, StderrPlan::wiring),
        )
    }

    /// Spawn the process and its supervisor.
    pub(crate) fn spawn(&mut self, shared: &Arc<Shared>) -> Result<SpawnedIo, SpawnError> {
        let stdin = self.stdin.take().unwrap_or(StdinPlan::Null);
        let stdout = self.stdout.take().unwrap_or(StdoutPlan::Null);
        let stderr = self.stderr.take().unwrap_or(StderrPlan::Null);

        let mut cmd = tokio::process::Command::new(self.spec.program());
        cmd.args(self.spec.args())
            .stdin(stdin.stdio())
            .stdout(stdout.stdio())
            .stderr(stderr.stdio())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| SpawnError::from_io(self.spec.program(), err))?;
        shared.stage_spawned(self.index, child.id());

        let kill = shared.stage_kill(self.index);
        let mut io = SpawnedIo::default();
        let mut input = None;
        let mut pumps = Vec::new();

        match stdin {
            StdinPlan::Source(reader) => {
                if let Some(writer) = child.stdin.take() {
                    let (failed, failure) = oneshot::channel();
                    input = Some(Feed {
                        task: tokio::spawn(feed(reader, writer, failed)),
                        failure,
                    });
                }
            }
            StdinPlan::Pipe => io.link_stdin = child.stdin.take(),
            StdinPlan::Null => {}
        }

        match stdout {
            StdoutPlan::Sink(sink, _) => {
                if let Some(reader) = child.stdout.take() {
                    pumps.push(tokio::spawn(drain(reader, sink, kill.clone())));
                }
            }
            StdoutPlan::Pipe => io.link_stdout = child.stdout.take(),
            StdoutPlan::Exposed => io.exposed_stdout = child.stdout.take(),
            StdoutPlan::Null => {}
        }

        match stderr {
            StderrPlan::Sink(sink, _) => {
                if let Some(reader) = child.stderr.take() {
                    pumps.push(tokio::spawn(drain(reader, sink, kill.clone())));
                }
            }
            StderrPlan::Exposed => io.exposed_stderr = child.stderr.take(),
            StderrPlan::Null => {}
        }

        self.task = Some(tokio::spawn(supervise(
            child,
            kill,
            input,
            pumps,
            Arc::clone(shared),
            self.index,
        )));

        Ok(io)
    }

    /// Wait for the supervisor to report.
    ///
    /// A stage that was never spawned, or was already waited on, reports an
    /// I/O error rather than blocking.
    pub(crate) async fn wait(&mut self) -> StageExit {
        let Some(task) = self.task.take() else {
            return StageExit {
                status: Err(io::Error::other(format!(
                    "stage {} is not running",
                    self.index
                ))),
                io_error: None,
            };
        };

        match task.await {
            Ok(exit) => exit,
            Err(err) => StageExit {
                status: Err(io::Error::other(err)),
                io_error: None,
            },
        }
    }
}

async fn supervise(
    mut child: Child,
    kill: CancellationToken,
    input: Option<Feed>,
    pumps: Vec<JoinHandle<io::Result<u64>>>,
    shared: Arc<Shared>,
    index: usize,
) -> StageExit {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            // Fails only when the child is already gone.
            let _ = child.start_kill();
            child.wait().await
        }
    };
    shared.stage_reaped(index);

    let mut io_error = None;
    if let Some(mut input) = input {
        input.task.abort();
        // A failing feed reports before it releases the child's stdin.
        if let Ok(err) = input.failure.try_recv() {
            io_error = Some(err);
        }
    }

    for pump in pumps {
        let result = match pump.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err)),
        };
        if let Err(err) = result {
            io_error.get_or_insert(err);
        }
    }

    StageExit { status, io_error }
}

async fn feed(
    mut reader: InputSource,
    mut writer: ChildStdin,
    failed: oneshot::Sender<io::Error>,
) {
    match tokio::io::copy(&mut reader, &mut writer).await {
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => {
            let _ = failed.send(err);
        }
        _ => {}
    }
    drop(writer);
}

async fn drain<R>(mut reader: R, mut sink: OutputSink, kill: CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;

        copied = tokio::io::copy(&mut reader, &mut sink) => {
            let copied = copied?;
            sink.flush().await?;
            Ok(copied)
        }
        () = kill.cancelled() => Ok(0),
    }
}
