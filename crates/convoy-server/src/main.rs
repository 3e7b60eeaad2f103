//! Main entry point of the Convoy worker process.
//!
//! Starts the configured number of worker nodes over a shared in-memory store
//! and shuts them down gracefully on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use convoy_server::config::Configuration;
use convoy_server::startup::{self, shutdown_all, wait_for_shutdown_signal};
use convoy_server::worker::{Trigger, WorkerNode, put_trigger};
use convoy_store::{KvStore, MemoryStore, Prefix};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;

    let logging_config = configuration.logging_config();
    let _logging_guard = startup::init_logging(&logging_config)?;

    let metrics = startup::init_metrics()?;

    let store: Arc<dyn KvStore> = MemoryStore::new();
    let group = configuration.group();
    let node_id_prefix = configuration.node_id_prefix();
    info!(
        group = %group,
        nodes = configuration.node_count(),
        "Starting Convoy worker nodes"
    );

    let mut workers = Vec::with_capacity(configuration.node_count());
    for _ in 0..configuration.node_count() {
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let node_id = format!("{}-{}", node_id_prefix, &short_id[..8]);
        match WorkerNode::start(store.clone(), &node_id, &configuration).await {
            Ok(worker) => workers.push(worker),
            Err(err) => {
                error!("{:#}", err);
                let processes: Vec<_> = workers.iter().map(|w| w.process.clone()).collect();
                shutdown_all(&processes, "startup failed", Duration::from_secs(30)).await;
                return Err(err);
            }
        }
    }

    let seed = configuration.demo_seed();
    if seed > 0 {
        let prefix = Prefix::new(configuration.trigger_prefix());
        for i in 0..seed {
            let trigger = Trigger {
                project_id: 1000,
                receiver_id: format!("receiver-{}", i % 10),
                id: format!("demo-{i}"),
                payload: serde_json::json!({ "index": i }),
            };
            put_trigger(store.as_ref(), &prefix, &trigger).await?;
        }
        info!("Created {} demo triggers", seed);
    }

    if let Some(worker) = workers.first() {
        info!(nodes = ?worker.distribution.nodes(), "Convoy started");
    }

    let signal = wait_for_shutdown_signal().await;
    info!("Received {}, initiating graceful shutdown...", signal);

    let processes: Vec<_> = workers.iter().map(|w| w.process.clone()).collect();
    shutdown_all(&processes, signal, Duration::from_secs(60)).await;

    debug!("Final metrics:\n{}", metrics.render());
    Ok(())
}
