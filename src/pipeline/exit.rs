//! Exit status reconciliation.
//!
//! A stage can end by exiting with a status code or by being terminated by a
//! signal. Both are folded into a single `code`: signal terminations and
//! stages of a pipeline that was asked to stop report [`INTERRUPT_EXIT_CODE`].

use std::fmt;
use std::process::ExitStatus;

/// Exit code reported for stages terminated by a signal or killed on request.
#[cfg(unix)]
pub const INTERRUPT_EXIT_CODE: i32 = nix::sys::signal::Signal::SIGINT as i32;

/// Exit code reported for stages terminated by a signal or killed on request.
#[cfg(not(unix))]
pub const INTERRUPT_EXIT_CODE: i32 = 2;

/// Exit code used when no status could be obtained.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The process exited with a status code.
    Exited,
    /// The process was terminated by a signal.
    Signaled,
    /// Waiting failed; no status is available.
    Unknown,
}

/// Reconciled exit information for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Index of the stage this report describes.
    pub stage: usize,
    /// Reconciled exit code.
    pub code: i32,
    /// How the stage ended.
    pub kind: ExitKind,
    /// Terminating signal number, when signaled.
    pub signal: Option<i32>,
    /// Whether a kill, cancel or terminate was requested on the pipeline.
    pub killed: bool,
    /// Raw status from the OS.
    pub status: Option<ExitStatus>,
}

impl ExitReport {
    /// Build a report from an OS exit status.
    #[must_use]
    pub fn from_status(stage: usize, status: ExitStatus, killed: bool) -> Self {
        let signal = signal_of(status);
        let kind = if signal.is_some() {
            ExitKind::Signaled
        } else {
            ExitKind::Exited
        };
        let code = if killed || signal.is_some() {
            INTERRUPT_EXIT_CODE
        } else {
            status.code().unwrap_or(UNKNOWN_EXIT_CODE)
        };

        Self {
            stage,
            code,
            kind,
            signal,
            killed,
            status: Some(status),
        }
    }

    /// Build a report for a stage whose status could not be collected.
    #[must_use]
    pub fn unknown(stage: usize, killed: bool) -> Self {
        Self {
            stage,
            code: if killed {
                INTERRUPT_EXIT_CODE
            } else {
                UNKNOWN_EXIT_CODE
            },
            kind: ExitKind::Unknown,
            signal: None,
            killed,
            status: None,
        }
    }

    /// Whether the stage exited on its own with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.killed && self.status.is_some_and(|status| status.success())
    }

    /// Whether the code is the interrupt sentinel.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.code == INTERRUPT_EXIT_CODE && (self.killed || self.kind == ExitKind::Signaled)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.signal) {
            (ExitKind::Signaled, Some(signal)) => write!(
                f,
                "terminated by signal {} (exit code {})",
                signal_name(signal),
                self.code
            ),
            (ExitKind::Unknown, _) => write!(f, "ended with unknown status (exit code {})", self.code),
            _ if self.killed => write!(f, "was killed (exit code {})", self.code),
            _ => write!(f, "exited with code {}", self.code),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map_or_else(|_| signal.to_string(), |s| s.as_str().to_string())
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}
