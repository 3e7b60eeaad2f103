//! Process startup: logging, metrics and signal handling

mod logging;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{shutdown_all, wait_for_shutdown_signal};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the global metrics recorder and registers metric descriptions.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    convoy_core::metrics::init_metrics();
    Ok(handle)
}
