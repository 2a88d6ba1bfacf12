//! Pipeline tests against real processes.

mod capture_test;
mod lifecycle_test;

use std::sync::{Arc, Mutex};

use procpipe::pipeline::{PipelineEvent, PipelineLogger};

/// Logger that keeps every event it receives.
#[derive(Clone, Default)]
pub struct RecordingLogger {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl RecordingLogger {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl PipelineLogger for RecordingLogger {
    fn log(&self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Verify the public pipeline types are exported from the library.
#[test]
fn test_all_pipeline_types_exported() {
    use procpipe::pipeline::{
        CaptureBuffer, Command, ErrorKind, ExitKind, LifecycleState, NoopLogger, PipelineError,
        PipelineOptions, SpawnError, TracingLogger, Wiring, INTERRUPT_EXIT_CODE,
    };

    let _ = Command::new("true");
    let _ = CaptureBuffer::new();
    let _ = PipelineOptions::new().with_logger(NoopLogger).with_logger(TracingLogger);
    let _: fn() -> PipelineError = || PipelineError::NoCommands;
    let _: fn() -> SpawnError = || SpawnError::NotFound {
        program: "x".to_string(),
    };

    assert_eq!(INTERRUPT_EXIT_CODE, 2);
    assert_eq!(PipelineError::NotStarted.kind(), ErrorKind::State);
    assert_ne!(ExitKind::Exited, ExitKind::Signaled);
    assert_eq!(Wiring::FromStage(1).to_string(), "pipe<-1");
    assert_ne!(LifecycleState::Created, LifecycleState::Started);
}
