//! Process signal handling
//!
//! The first Ctrl+C or SIGTERM starts the graceful shutdown of every worker
//! node; running tasks are drained by the task nodes' shutdown hooks.

use std::sync::Arc;
use std::time::Duration;

use convoy_common::Process;
use futures::future::join_all;
use tracing::{error, info, warn};

/// Waits for Ctrl+C or SIGTERM and returns the signal name.
pub async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}

/// Shuts down all processes concurrently, bounded by `timeout`.
pub async fn shutdown_all(processes: &[Arc<Process>], reason: &str, timeout: Duration) {
    info!("Shutdown initiated, waiting up to {:?} for {} nodes...", timeout, processes.len());
    let all = join_all(processes.iter().map(|p| p.shutdown(reason)));
    if tokio::time::timeout(timeout, all).await.is_err() {
        warn!("Shutdown timed out after {:?}", timeout);
        return;
    }
    info!("Shutdown complete");
}
