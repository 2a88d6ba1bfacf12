//! Pipeline lifecycle control.
//!
//! A [`Pipeline`] moves through `Created -> Started -> Exited` exactly once.
//! Every stage shares one cancellation token; each stage's supervisor kills
//! its process when that token (or the stage's own child token) fires, so a
//! timeout, a cancel or a teardown reaches every stage at once.
//!
//! Stages are spawned in order and reported in order. [`Pipeline::wait`]
//! stops at the first stage that fails; the remaining stages are reclaimed
//! when the shared token is cancelled during teardown.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use super::builder::{self, Captured, OutputMode};
use super::command::{Command, CommandSpec};
use super::error::PipelineError;
use super::exit::ExitReport;
use super::logger::{PipelineEvent, PipelineLogger};
use super::options::PipelineOptions;
use super::pipe::PipeLink;
use super::signal::StopRegistration;
use super::stage::Stage;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Exited,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Started,
            _ => Self::Exited,
        }
    }
}

/// State shared between the controller, stage supervisors and handles.
pub(crate) struct Shared {
    state: AtomicU8,
    killed: AtomicBool,
    timed_out: AtomicBool,
    pub(crate) cancel: CancellationToken,
    /// Child of `cancel` fired by kill; parent of every stage and link token.
    halt: CancellationToken,
    /// Fired once the pipeline leaves `Created`.
    started: CancellationToken,
    stage_kills: Vec<CancellationToken>,
    pids: Vec<AtomicU32>,
    live: watch::Sender<usize>,
    logger: Arc<dyn PipelineLogger>,
    log_level: Level,
}

impl Shared {
    fn new(stages: usize, options: &PipelineOptions) -> Self {
        let cancel = CancellationToken::new();
        let halt = cancel.child_token();
        let (live, _) = watch::channel(0);
        Self {
            state: AtomicU8::new(LifecycleState::Created as u8),
            killed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            stage_kills: (0..stages).map(|_| halt.child_token()).collect(),
            pids: (0..stages).map(|_| AtomicU32::new(0)).collect(),
            cancel,
            halt,
            started: CancellationToken::new(),
            live,
            logger: Arc::clone(&options.logger),
            log_level: options.log_level,
        }
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        if event.level() <= self.log_level {
            self.logger.log(&event);
        }
    }

    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_exited(&self) {
        self.state
            .store(LifecycleState::Exited as u8, Ordering::SeqCst);
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    fn expire(&self, timeout: Duration) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.emit(PipelineEvent::TimedOut { timeout });
        self.cancel.cancel();
    }

    pub(crate) fn stage_kill(&self, index: usize) -> CancellationToken {
        self.stage_kills
            .get(index)
            .cloned()
            .unwrap_or_else(|| self.halt.child_token())
    }

    /// Token that stops a pipe link relay on kill or cancel.
    pub(crate) fn link_stop(&self) -> CancellationToken {
        self.halt.child_token()
    }

    fn kill_stages(&self) {
        self.halt.cancel();
    }

    pub(crate) fn stage_spawned(&self, index: usize, pid: Option<u32>) {
        if let Some(slot) = self.pids.get(index) {
            slot.store(pid.unwrap_or(0), Ordering::SeqCst);
        }
        self.live.send_modify(|live| *live += 1);
    }

    pub(crate) fn stage_reaped(&self, index: usize) {
        if let Some(slot) = self.pids.get(index) {
            slot.store(0, Ordering::SeqCst);
        }
        self.live.send_modify(|live| *live = live.saturating_sub(1));
    }

    #[cfg(unix)]
    fn signal_live(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        for slot in &self.pids {
            let pid = slot.load(Ordering::SeqCst);
            if pid == 0 {
                continue;
            }
            let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            let _ = kill(nix_pid, signal);
        }
    }
}

/// Cloneable handle for stopping a pipeline from another task.
#[derive(Clone)]
pub struct PipelineHandle {
    pub(crate) shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Whether kill, cancel or terminate was requested.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.shared.is_killed()
    }

    /// Whether the pipeline deadline expired.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.shared.is_timed_out()
    }

    /// Get a clone of the shared cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Forcefully kill every stage.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` unless the pipeline is running.
    pub fn kill(&self) -> Result<(), PipelineError> {
        self.shared.emit(PipelineEvent::KillRequested);
        if self.shared.state() != LifecycleState::Started {
            return Err(PipelineError::NotStarted);
        }

        self.shared.killed.store(true, Ordering::SeqCst);
        self.shared.kill_stages();
        Ok(())
    }

    /// Cancel the shared context and mark the pipeline exited.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` unless the pipeline is running.
    pub fn cancel(&self) -> Result<(), PipelineError> {
        self.shared.emit(PipelineEvent::CancelRequested);
        if !self
            .shared
            .transition(LifecycleState::Started, LifecycleState::Exited)
        {
            return Err(PipelineError::NotStarted);
        }

        self.shared.killed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        Ok(())
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// On Unix, sends SIGTERM to every live stage, then kills whatever is
    /// still running after `grace`. On other platforms, falls back to kill.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` unless the pipeline is running.
    pub async fn terminate(&self, grace: Duration) -> Result<(), PipelineError> {
        self.shared.emit(PipelineEvent::TerminateRequested { grace });
        if self.shared.state() != LifecycleState::Started {
            return Err(PipelineError::NotStarted);
        }
        self.shared.killed.store(true, Ordering::SeqCst);

        #[cfg(unix)]
        {
            self.shared
                .signal_live(nix::sys::signal::Signal::SIGTERM);

            let mut live = self.shared.live.subscribe();
            let drained = tokio::time::timeout(grace, live.wait_for(|n| *n == 0))
                .await
                .is_ok();
            if !drained {
                self.shared.kill_stages();
            }
        }

        #[cfg(not(unix))]
        {
            let _ = grace;
            self.shared.kill_stages();
        }

        Ok(())
    }

    /// Kill the pipeline when `notifier` completes.
    ///
    /// The observer task ends after the first notification, or when the
    /// pipeline is torn down, whichever comes first. A notification that
    /// arrives before `start` is held and acted on once the pipeline starts.
    /// Dropping the returned registration unregisters it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn register_external_stop<F>(&self, notifier: F) -> StopRegistration
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.clone();
        let task = tokio::spawn(async move {
            let teardown = handle.shared.cancel.clone();
            let started = handle.shared.started.clone();
            let notified = async move {
                notifier.await;
                started.cancelled_owned().await;
            };
            tokio::select! {
                biased;

                () = teardown.cancelled() => {}
                () = notified => {
                    handle.shared.emit(PipelineEvent::ExternalStop);
                    let _ = handle.kill();
                }
            }
        });
        StopRegistration::new(task)
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("state", &self.state())
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// A prepared chain of processes.
pub struct Pipeline {
    stages: Vec<Stage>,
    links: Vec<PipeLink>,
    shared: Arc<Shared>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    stop_token: Option<CancellationToken>,
    registrations: Vec<StopRegistration>,
    watchdog: Option<JoinHandle<()>>,
    exposed_stdout: Option<ChildStdout>,
    exposed_stderr: Option<ChildStderr>,
    closed: bool,
}

impl Pipeline {
    /// Prepare a pipeline whose last stage writes to its own sinks.
    ///
    /// # Errors
    ///
    /// Returns a validation error if no commands are given, a stage has an
    /// empty program, or a stream override is attached to the wrong stage.
    pub fn create(options: PipelineOptions, commands: Vec<Command>) -> Result<Self, PipelineError> {
        Self::prepare(options, commands, OutputMode::Sink).map(|(pipeline, _)| pipeline)
    }

    /// Prepare a pipeline whose last stage's stdout and stderr are exposed.
    ///
    /// The streams become available through [`take_stdout`](Self::take_stdout)
    /// and [`take_stderr`](Self::take_stderr) once the pipeline is started.
    ///
    /// # Errors
    ///
    /// Same validation errors as [`create`](Self::create).
    pub fn pipe_output(
        options: PipelineOptions,
        commands: Vec<Command>,
    ) -> Result<Self, PipelineError> {
        Self::prepare(options, commands, OutputMode::Stream).map(|(pipeline, _)| pipeline)
    }

    pub(crate) fn prepare(
        options: PipelineOptions,
        commands: Vec<Command>,
        mode: OutputMode,
    ) -> Result<(Self, Captured), PipelineError> {
        builder::validate(&commands)?;

        let shared = Arc::new(Shared::new(commands.len(), &options));
        shared.emit(PipelineEvent::Preparing {
            pipeline: describe(commands.iter().map(Command::spec)),
            stages: commands.len(),
        });

        let (stages, captured) = builder::wire(commands, mode, |event| shared.emit(event));
        let timeout = options.effective_timeout();

        let pipeline = Self {
            stages,
            links: Vec::new(),
            shared,
            timeout,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            stop_token: options.stop_token,
            registrations: Vec::new(),
            watchdog: None,
            exposed_stdout: None,
            exposed_stderr: None,
            closed: false,
        };
        Ok((pipeline, captured))
    }

    /// Number of stages.
    #[must_use]
    pub fn count(&self) -> usize {
        self.stages.len()
    }

    /// Program and arguments of stage `index`.
    #[must_use]
    pub fn command(&self, index: usize) -> Option<&CommandSpec> {
        self.stages.get(index).map(Stage::spec)
    }

    /// Reconciled exit code of stage `index`, once it has been waited on.
    #[must_use]
    pub fn exit_code(&self, index: usize) -> Option<i32> {
        self.stages.get(index).and_then(Stage::exit_code)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Whether kill, cancel or terminate was requested.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.shared.is_killed()
    }

    /// The configured timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Get a handle for stopping the pipeline from another task.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take ownership of the last stage's stdout in streaming mode.
    ///
    /// This can only be called once, after start; other calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.exposed_stdout.take()
    }

    /// Take ownership of the last stage's stderr in streaming mode.
    ///
    /// This can only be called once, after start; other calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.exposed_stderr.take()
    }

    /// Spawn every stage, in order.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::AlreadyStarted` if the pipeline was started
    /// before, or `PipelineError::Spawn` for the first stage that could not
    /// be spawned. A spawn failure tears the pipeline down.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since stages and their
    /// supervisors are spawned on it.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if !self
            .shared
            .transition(LifecycleState::Created, LifecycleState::Started)
        {
            return Err(PipelineError::AlreadyStarted);
        }
        self.shared.started.cancel();
        self.arm();

        let total = self.stages.len();
        let mut upstream: Option<ChildStdout> = None;

        for index in 0..total {
            let stage = &mut self.stages[index];
            self.shared.emit(PipelineEvent::StageStarting {
                index,
                total,
                command: stage.spec().to_string(),
            });

            let io = match stage.spawn(&self.shared) {
                Ok(io) => io,
                Err(source) => {
                    let command = stage.spec().to_string();
                    self.close();
                    return Err(PipelineError::Spawn {
                        index,
                        command,
                        source,
                    });
                }
            };

            if let (Some(stdout), Some(stdin)) = (upstream.take(), io.link_stdin) {
                self.links.push(PipeLink::connect(
                    index - 1,
                    stdout,
                    stdin,
                    self.shared.link_stop(),
                ));
            }
            upstream = io.link_stdout;

            if io.exposed_stdout.is_some() {
                self.exposed_stdout = io.exposed_stdout;
            }
            if io.exposed_stderr.is_some() {
                self.exposed_stderr = io.exposed_stderr;
            }
        }

        Ok(())
    }

    /// Wait for every stage, in order, and return the last stage's report.
    ///
    /// The pipeline is torn down on return, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` if the pipeline is not running,
    /// `PipelineError::StageFailed` or `PipelineError::TimedOut` for the
    /// first stage that did not succeed, and `PipelineError::StageIo` if a
    /// stage could not be waited on or its sinks failed.
    pub async fn wait(&mut self) -> Result<ExitReport, PipelineError> {
        if self.shared.state() != LifecycleState::Started {
            return Err(PipelineError::NotStarted);
        }

        let result = self.wait_stages().await;
        self.close();
        result
    }

    /// Start the pipeline and wait for it.
    ///
    /// # Errors
    ///
    /// Any error from [`start`](Self::start) or [`wait`](Self::wait).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub async fn run(&mut self) -> Result<ExitReport, PipelineError> {
        self.start()?;
        self.wait().await
    }

    /// Forcefully kill every stage. See [`PipelineHandle::kill`].
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` unless the pipeline is running.
    pub fn kill(&self) -> Result<(), PipelineError> {
        self.handle().kill()
    }

    /// Cancel the shared context. See [`PipelineHandle::cancel`].
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` unless the pipeline is running.
    pub fn cancel(&self) -> Result<(), PipelineError> {
        self.handle().cancel()
    }

    /// Terminate gracefully. See [`PipelineHandle::terminate`].
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotStarted` unless the pipeline is running.
    pub async fn terminate(&self, grace: Duration) -> Result<(), PipelineError> {
        self.handle().terminate(grace).await
    }

    /// Kill the pipeline when `notifier` completes.
    /// See [`PipelineHandle::register_external_stop`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn register_external_stop<F>(&self, notifier: F) -> StopRegistration
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle().register_external_stop(notifier)
    }

    /// Release every resource held by the pipeline.
    ///
    /// Cancels the shared context, closes every pipe end and drops external
    /// stop registrations. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shared.mark_exited();
        self.shared.cancel.cancel();
        for link in &mut self.links {
            link.close_read();
        }
        self.registrations.clear();
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        self.shared.emit(PipelineEvent::Closed);
    }

    /// Start the deadline watchdog and the configured stop observer.
    fn arm(&mut self) {
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            let shared = Arc::clone(&self.shared);
            self.watchdog = Some(tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => shared.expire(timeout),
                    () = shared.cancel.cancelled() => {}
                }
            }));
        }

        if let Some(token) = self.stop_token.take() {
            let registration = self.register_external_stop(token.cancelled_owned());
            self.registrations.push(registration);
        }
    }

    async fn wait_stages(&mut self) -> Result<ExitReport, PipelineError> {
        let total = self.stages.len();
        let mut last = None;

        for index in 0..total {
            let command = self.stages[index].spec().to_string();
            self.shared.emit(PipelineEvent::StageWaiting {
                index,
                total,
                command: command.clone(),
            });

            let exit = self.stages[index].wait().await;
            let killed = self.shared.is_killed();
            let report = match &exit.status {
                Ok(status) => ExitReport::from_status(index, *status, killed),
                Err(_) => ExitReport::unknown(index, killed),
            };
            self.stages[index].set_exit_code(report.code);
            self.shared.emit(PipelineEvent::StageExited {
                index,
                total,
                report: report.clone(),
            });

            if !report.success() {
                return Err(self.failure(index, command, report, exit.status.err()));
            }
            if let Some(source) = exit.io_error {
                return Err(PipelineError::StageIo {
                    index,
                    command,
                    source,
                });
            }

            let drained = match find_link(&mut self.links, index) {
                Some(link) => link.close_write().await,
                None => None,
            };
            match drained {
                Some(Ok(bytes)) => self
                    .shared
                    .emit(PipelineEvent::LinkDrained { index, bytes }),
                Some(Err(source)) => {
                    return Err(PipelineError::StageIo {
                        index,
                        command,
                        source,
                    })
                }
                None => {}
            }
            if index > 0 {
                if let Some(link) = find_link(&mut self.links, index - 1) {
                    link.close_read();
                }
            }

            last = Some(report);
        }

        last.ok_or(PipelineError::NoCommands)
    }

    fn failure(
        &self,
        index: usize,
        command: String,
        report: ExitReport,
        wait_error: Option<std::io::Error>,
    ) -> PipelineError {
        if self.shared.is_timed_out() {
            if let Some(timeout) = self.timeout {
                return PipelineError::TimedOut { timeout, report };
            }
        }
        match wait_error {
            Some(source) => PipelineError::StageIo {
                index,
                command,
                source,
            },
            None => PipelineError::StageFailed {
                index,
                command,
                report,
            },
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        write!(
            f,
            "Pipeline({}, started={}, exited={})",
            describe(self.stages.iter().map(Stage::spec)),
            state != LifecycleState::Created,
            state == LifecycleState::Exited
        )
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.count())
            .field("state", &self.state())
            .field("killed", &self.is_killed())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn find_link(links: &mut [PipeLink], index: usize) -> Option<&mut PipeLink> {
    links.iter_mut().find(|link| link.index() == index)
}

fn describe<'a>(specs: impl Iterator<Item = &'a CommandSpec>) -> String {
    specs
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Captured result of [`output`].
#[derive(Debug, Clone)]
pub struct Output {
    /// Bytes the last stage wrote to stdout, unless it had its own sink.
    pub stdout: Vec<u8>,
    /// Bytes the last stage wrote to stderr, unless it had its own sink.
    pub stderr: Vec<u8>,
    /// Report of the last stage, or of the first stage that failed.
    pub report: ExitReport,
    /// Whether the pipeline deadline expired.
    pub timed_out: bool,
}

impl Output {
    /// Reconciled exit code.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.report.code
    }

    /// Whether every stage succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.report.success()
    }

    /// Stdout decoded as UTF-8, lossily.
    #[must_use]
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr decoded as UTF-8, lossily.
    #[must_use]
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Run a pipeline to completion, capturing the last stage's output.
///
/// Like `std::process::Command::output`, a stage that exits unsuccessfully
/// is not an error: the returned [`Output`] carries its report.
///
/// # Errors
///
/// Returns validation, spawn and stage I/O errors.
pub async fn output(
    options: PipelineOptions,
    commands: Vec<Command>,
) -> Result<Output, PipelineError> {
    let (mut pipeline, captured) = Pipeline::prepare(options, commands, OutputMode::Capture)?;

    let report = match pipeline.run().await {
        Ok(report) => report,
        Err(err) => err.into_report()?,
    };

    Ok(Output {
        stdout: captured.stdout.map(|buffer| buffer.take()).unwrap_or_default(),
        stderr: captured.stderr.map(|buffer| buffer.take()).unwrap_or_default(),
        report,
        timed_out: pipeline.handle().is_timed_out(),
    })
}
