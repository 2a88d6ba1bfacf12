//! Capture mode end to end.

use std::fs;
use std::time::Duration;

use procpipe::config::ConfigLoader;
use procpipe::pipeline::{output, CaptureBuffer, Command, PipelineError, PipelineOptions, INTERRUPT_EXIT_CODE};
use tempfile::TempDir;

fn fixture_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in ["xenon.txt", "box", "plain", "taxi"] {
        fs::write(dir.path().join(name), name).unwrap();
    }
    dir
}

#[tokio::test]
async fn ls_grep_sed_matches_reference() {
    let dir = fixture_dir();
    let path = dir.path().to_str().unwrap();

    let listing = std::process::Command::new("ls")
        .args(["-la", path])
        .output()
        .unwrap();
    let expected: String = String::from_utf8_lossy(&listing.stdout)
        .lines()
        .filter(|line| line.contains('x'))
        .map(|line| format!("{}\n", line.replace('x', "*")))
        .collect();

    let out = output(
        PipelineOptions::new(),
        vec![
            Command::new("ls").args(["-la", path]),
            Command::new("grep").arg("x"),
            Command::new("sed").arg("s/x/*/g"),
        ],
    )
    .await
    .unwrap();

    assert!(out.success());
    assert_eq!(out.code(), 0);
    assert!(!out.timed_out);
    assert_eq!(out.stdout_lossy(), expected);
    assert!(out.stdout_lossy().contains("*enon.txt"));
    assert!(out.stdout_lossy().contains("bo*"));
    assert!(!out.stdout_lossy().contains("plain"));
}

#[tokio::test]
async fn captures_last_stage_stderr() {
    let out = output(
        PipelineOptions::new(),
        vec![
            Command::new("echo").arg("hi"),
            Command::new("sh").args(["-c", "cat; echo done >&2"]),
        ],
    )
    .await
    .unwrap();

    assert_eq!(out.stdout_lossy(), "hi\n");
    assert_eq!(out.stderr_lossy(), "done\n");
}

#[tokio::test]
async fn caller_sinks_win_over_capture() {
    let sink = CaptureBuffer::new();
    let out = output(
        PipelineOptions::new(),
        vec![Command::new("echo").arg("mine").stdout(sink.clone())],
    )
    .await
    .unwrap();

    assert!(out.stdout.is_empty());
    assert_eq!(sink.contents(), b"mine\n");
}

#[tokio::test]
async fn unsuccessful_stage_is_not_an_error() {
    let out = output(
        PipelineOptions::new(),
        vec![
            Command::new("printf").arg("abc"),
            Command::new("grep").arg("zzz"),
        ],
    )
    .await
    .unwrap();

    assert!(!out.success());
    assert_eq!(out.code(), 1);
    assert_eq!(out.report.stage, 1);
    assert!(out.stdout.is_empty());
}

#[tokio::test]
async fn timeout_is_reported_in_output() {
    let out = output(
        PipelineOptions::new().with_timeout(Duration::from_millis(100)),
        vec![Command::new("sleep").arg("100")],
    )
    .await
    .unwrap();

    assert!(out.timed_out);
    assert_eq!(out.code(), INTERRUPT_EXIT_CODE);
}

#[tokio::test]
async fn spawn_errors_are_errors() {
    let err = output(
        PipelineOptions::new(),
        vec![Command::new("procpipe-no-such-program-xyz")],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PipelineError::Spawn { index: 0, .. }));
    assert!(err.exit_code().is_none());
}

#[tokio::test]
async fn options_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "timeout_ms = 100\nlog_level = \"trace\"\n").unwrap();

    let config = ConfigLoader::with_path(path).load().unwrap();
    let options = config.to_options().unwrap();
    assert_eq!(options.effective_timeout(), Some(Duration::from_millis(100)));
    assert_eq!(options.log_level, tracing::Level::TRACE);

    let out = output(options, vec![Command::new("sleep").arg("100")])
        .await
        .unwrap();
    assert!(out.timed_out);
}
