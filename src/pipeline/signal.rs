//! External stop notifications.
//!
//! [`PipelineHandle::register_external_stop`](super::PipelineHandle::register_external_stop)
//! spawns a detached observer that kills the pipeline the first time its
//! notifier completes. The observer also ends when the pipeline is torn down,
//! so it never outlives the pipeline's shared context.

use tokio::task::JoinHandle;

/// Registration of an external stop observer.
///
/// Dropping the registration unregisters the observer.
#[derive(Debug)]
pub struct StopRegistration {
    task: Option<JoinHandle<()>>,
}

impl StopRegistration {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Whether the observer is still waiting for a notification.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Unregister the observer.
    pub fn dispose(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StopRegistration {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Resolve when the process receives Ctrl-C or, on Unix, SIGTERM.
///
/// Meant to be passed to `register_external_stop`. If no handler can be
/// installed the future never resolves.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::debug!("Received Ctrl-C"),
        () = terminate => tracing::debug!("Received SIGTERM"),
    }
}
