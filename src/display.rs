//! Colored CLI status output.
//!
//! Everything here goes to stderr so the pipeline's own output on stdout
//! stays clean.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::pipeline::{ExitKind, ExitReport};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to a maximum length, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

/// One-line summary of an exit report.
#[must_use]
pub fn format_report(report: &ExitReport) -> String {
    match report.kind {
        ExitKind::Signaled => format!("stage {} signaled ({})", report.stage, report.code),
        ExitKind::Unknown => format!("stage {} status unknown", report.stage),
        ExitKind::Exited if report.killed => format!("stage {} killed ({})", report.stage, report.code),
        ExitKind::Exited => format!("stage {} exit {}", report.stage, report.code),
    }
}

/// Print the pipeline being started.
pub fn print_pipeline_start(description: &str, raw_mode: bool) {
    eprintln!(
        "{} {} {}",
        timestamp().dimmed(),
        "[PIPELINE]".blue().bold(),
        truncate(description, 120, raw_mode)
    );
    let _ = io::stderr().flush();
}

/// Print how the pipeline ended.
pub fn print_pipeline_end(report: &ExitReport, timed_out: bool) {
    let ts = timestamp();
    let summary = format_report(report);
    if timed_out {
        eprintln!("{} {} {}", ts.dimmed(), "[TIMEOUT]".yellow().bold(), summary);
    } else if report.success() {
        eprintln!("{} {} {}", ts.dimmed(), "[DONE]".green().bold(), summary);
    } else {
        eprintln!("{} {} {}", ts.dimmed(), "[FAILED]".red().bold(), summary);
    }
    let _ = io::stderr().flush();
}

/// Print that an external stop was received.
pub fn print_stop_requested() {
    eprintln!(
        "{} {} stopping pipeline",
        timestamp().dimmed(),
        "[SIGNAL]".magenta().bold()
    );
    let _ = io::stderr().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
    let _ = io::stderr().flush();
}
