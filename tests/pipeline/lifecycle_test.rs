//! Single-use lifecycle and exit-code reconciliation.

use std::time::{Duration, Instant};

use procpipe::pipeline::{
    Command, ErrorKind, LifecycleState, Pipeline, PipelineError, PipelineEvent, PipelineOptions,
    SpawnError, INTERRUPT_EXIT_CODE,
};

use super::RecordingLogger;

fn sleeper() -> Pipeline {
    Pipeline::create(PipelineOptions::new(), vec![Command::new("sleep").arg("100")]).unwrap()
}

#[tokio::test]
async fn wait_before_start_is_a_state_error() {
    let mut pipeline = sleeper();
    assert!(matches!(pipeline.wait().await, Err(PipelineError::NotStarted)));
    assert_eq!(pipeline.state(), LifecycleState::Created);
}

#[tokio::test]
async fn kill_and_cancel_before_start_are_state_errors() {
    let pipeline = sleeper();
    assert!(matches!(pipeline.kill(), Err(PipelineError::NotStarted)));
    assert!(matches!(pipeline.cancel(), Err(PipelineError::NotStarted)));
    assert!(!pipeline.is_killed());
    assert_eq!(pipeline.state(), LifecycleState::Created);
}

#[tokio::test]
async fn start_twice_is_a_state_error() {
    let mut pipeline =
        Pipeline::create(PipelineOptions::new(), vec![Command::new("true")]).unwrap();
    pipeline.start().unwrap();

    let err = pipeline.start().unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyStarted));
    assert_eq!(err.kind(), ErrorKind::State);

    // The first start is untouched by the rejected second one.
    let report = pipeline.wait().await.unwrap();
    assert_eq!(report.code, 0);
    assert_eq!(pipeline.state(), LifecycleState::Exited);
}

#[tokio::test]
async fn exited_pipeline_rejects_every_operation() {
    let mut pipeline =
        Pipeline::create(PipelineOptions::new(), vec![Command::new("true")]).unwrap();
    pipeline.run().await.unwrap();

    assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyStarted)));
    assert!(matches!(pipeline.wait().await, Err(PipelineError::NotStarted)));
    assert!(matches!(pipeline.kill(), Err(PipelineError::NotStarted)));
    assert!(matches!(pipeline.cancel(), Err(PipelineError::NotStarted)));
}

#[tokio::test]
async fn run_reports_last_stage_exit_code() {
    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![
            Command::new("echo").arg("hello"),
            Command::new("sh").args(["-c", "cat >/dev/null; exit 0"]),
        ],
    )
    .unwrap();

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.stage, 1);
    assert_eq!(report.code, 0);
    assert_eq!(pipeline.exit_code(0), Some(0));
    assert_eq!(pipeline.exit_code(1), Some(0));
    assert!(!pipeline.is_killed());
}

#[tokio::test]
async fn failing_middle_stage_is_reported() {
    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![
            Command::new("echo").arg("x"),
            Command::new("sh").args(["-c", "cat >/dev/null; exit 3"]),
            Command::new("cat"),
        ],
    )
    .unwrap();

    match pipeline.run().await {
        Err(PipelineError::StageFailed { index, report, .. }) => {
            assert_eq!(index, 1);
            assert_eq!(report.code, 3);
            assert!(!report.killed);
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
    assert_eq!(pipeline.exit_code(1), Some(3));
    assert_eq!(pipeline.exit_code(2), None);
    assert_eq!(pipeline.state(), LifecycleState::Exited);
}

#[tokio::test]
async fn kill_forces_interrupt_sentinel() {
    let mut pipeline = sleeper();
    pipeline.start().unwrap();
    pipeline.kill().unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.exit_code(), Some(INTERRUPT_EXIT_CODE));
    assert!(err.report().unwrap().killed);
    assert!(pipeline.is_killed());
}

#[tokio::test]
async fn kill_from_another_task() {
    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![Command::new("sleep").arg("100"), Command::new("cat")],
    )
    .unwrap();
    pipeline.start().unwrap();

    let handle = pipeline.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.kill().unwrap();
    });

    let started = Instant::now();
    let err = pipeline.wait().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(err.exit_code(), Some(INTERRUPT_EXIT_CODE));
    assert!(pipeline.is_killed());
}

#[tokio::test]
async fn timeout_bounds_the_whole_pipeline() {
    let options = PipelineOptions::new().with_timeout(Duration::from_millis(100));
    let mut pipeline = Pipeline::create(
        options,
        vec![Command::new("sleep").arg("100"), Command::new("cat")],
    )
    .unwrap();
    assert_eq!(pipeline.timeout(), Some(Duration::from_millis(100)));

    let started = Instant::now();
    let err = pipeline.run().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));

    match err {
        PipelineError::TimedOut { timeout, report } => {
            assert_eq!(timeout, Duration::from_millis(100));
            assert_eq!(report.code, INTERRUPT_EXIT_CODE);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(pipeline.handle().is_timed_out());
}

#[tokio::test]
async fn zero_timeout_means_none() {
    let mut pipeline = Pipeline::create(
        PipelineOptions::new().with_timeout(Duration::ZERO),
        vec![Command::new("sleep").arg("0.2")],
    )
    .unwrap();
    assert_eq!(pipeline.timeout(), None);
    assert_eq!(pipeline.run().await.unwrap().code, 0);
}

#[tokio::test]
async fn cancel_marks_exited_and_reclaims_stages() {
    let mut pipeline = sleeper();
    pipeline.start().unwrap();
    let token = pipeline.handle().cancellation_token();

    pipeline.cancel().unwrap();
    assert!(token.is_cancelled());
    assert!(pipeline.is_killed());
    assert_eq!(pipeline.state(), LifecycleState::Exited);
    assert!(matches!(pipeline.wait().await, Err(PipelineError::NotStarted)));
    assert!(matches!(pipeline.cancel(), Err(PipelineError::NotStarted)));
}

#[tokio::test]
async fn spawn_failure_names_the_stage() {
    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![
            Command::new("sleep").arg("100"),
            Command::new("procpipe-no-such-program-xyz"),
        ],
    )
    .unwrap();

    match pipeline.start() {
        Err(PipelineError::Spawn { index, source, .. }) => {
            assert_eq!(index, 1);
            assert!(matches!(source, SpawnError::NotFound { .. }));
        }
        other => panic!("expected spawn failure, got {other:?}"),
    }
    assert_eq!(pipeline.state(), LifecycleState::Exited);
    assert!(pipeline.handle().cancellation_token().is_cancelled());
}

#[tokio::test]
async fn close_is_idempotent() {
    let mut pipeline = sleeper();
    pipeline.start().unwrap();
    pipeline.close();
    pipeline.close();
    assert_eq!(pipeline.state(), LifecycleState::Exited);
}

#[tokio::test]
async fn display_reflects_state() {
    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![Command::new("echo").arg("a b"), Command::new("cat")],
    )
    .unwrap();
    assert_eq!(
        pipeline.to_string(),
        "Pipeline(echo 'a b' | cat, started=false, exited=false)"
    );

    pipeline.run().await.unwrap();
    assert_eq!(
        pipeline.to_string(),
        "Pipeline(echo 'a b' | cat, started=true, exited=true)"
    );
}

#[tokio::test]
async fn logger_receives_lifecycle_events() {
    let logger = RecordingLogger::default();
    let options = PipelineOptions::new()
        .with_logger(logger.clone())
        .with_log_level(tracing::Level::TRACE);
    let mut pipeline = Pipeline::create(
        options,
        vec![Command::new("printf").arg("abc"), Command::new("cat")],
    )
    .unwrap();
    pipeline.run().await.unwrap();

    let events = logger.events();
    assert!(matches!(
        events.first(),
        Some(PipelineEvent::Preparing { stages: 2, .. })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::StageStarting { index: 1, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::LinkDrained { index: 0, bytes: 3 })));
    assert_eq!(events.last(), Some(&PipelineEvent::Closed));
}

#[tokio::test]
async fn debug_level_hides_trace_events() {
    let logger = RecordingLogger::default();
    let options = PipelineOptions::new().with_logger(logger.clone());
    let mut pipeline = sleeper_with(options);
    pipeline.start().unwrap();
    pipeline.kill().unwrap();
    let _ = pipeline.wait().await;

    let events = logger.events();
    assert!(events
        .iter()
        .all(|e| e.level() == tracing::Level::DEBUG));
    assert!(events.contains(&PipelineEvent::KillRequested));
}

fn sleeper_with(options: PipelineOptions) -> Pipeline {
    Pipeline::create(options, vec![Command::new("sleep").arg("100")]).unwrap()
}

#[tokio::test]
async fn kill_ends_wait_while_a_link_is_held_open() {
    // The background sleep keeps stage 0's stdout open after the shell exits.
    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![
            Command::new("sh").args(["-c", "sleep 4 & exit 0"]),
            Command::new("cat"),
        ],
    )
    .unwrap();
    pipeline.start().unwrap();

    let handle = pipeline.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.kill().unwrap();
    });

    let started = Instant::now();
    let err = pipeline.wait().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.exit_code(), Some(INTERRUPT_EXIT_CODE));
}

#[tokio::test]
async fn stages_after_a_failure_are_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("stage1.pid");
    let script = format!("echo $$ > {}; exec sleep 100", pidfile.display());

    let mut pipeline = Pipeline::create(
        PipelineOptions::new(),
        vec![
            Command::new("sh").args(["-c", "sleep 0.3; exit 1"]),
            Command::new("sh").args(["-c", script.as_str()]),
        ],
    )
    .unwrap();

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::StageFailed { index: 0, .. }));

    let pid: i32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let pid = nix::unistd::Pid::from_raw(pid);

    let gone = tokio::time::timeout(Duration::from_secs(5), async {
        while nix::sys::signal::kill(pid, None).is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "stage 1 still alive after teardown");
}
