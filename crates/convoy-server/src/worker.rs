//! Worker node: membership, task node and the trigger orchestrator of one
//! simulated process.
//!
//! A trigger is a JSON entry under the trigger prefix. The node owning the
//! trigger's receiver processes it once and deletes the trigger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use convoy_common::{CancelHandle, Context, Process, SystemClock};
use convoy_core::distribution::{DistributionNode, LoggingListener};
use convoy_core::orchestrator::{self, OrchestratorConfig, OrchestratorDeps, WatchEntry};
use convoy_core::task::{TaskKey, TaskNode, TaskResult, task_fn};
use convoy_store::{KvStore, Prefix, encode_json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Configuration;

pub const TRIGGER_TASK_TYPE: &str = "trigger.process";

/// Work item created under the trigger prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub project_id: u64,
    pub receiver_id: String,
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Trigger {
    /// Triggers of one receiver are always processed by the same node.
    pub fn distribution_key(&self) -> String {
        format!("{}/{}", self.project_id, self.receiver_id)
    }
}

/// Stores a trigger, returns its key.
pub async fn put_trigger(store: &dyn KvStore, prefix: &Prefix, trigger: &Trigger) -> anyhow::Result<String> {
    let key = prefix.key(&format!("{}/{}", trigger.distribution_key(), trigger.id));
    let value = encode_json(&key, trigger)?;
    store.put(&key, value, None).await?;
    Ok(key)
}

/// One simulated worker process
pub struct WorkerNode {
    pub process: Arc<Process>,
    pub distribution: Arc<DistributionNode>,
    pub tasks: Arc<TaskNode>,
}

impl WorkerNode {
    /// Starts all components of the node.
    ///
    /// When a component fails, the ones already started are shut down before
    /// the error is returned.
    pub async fn start(
        store: Arc<dyn KvStore>,
        node_id: &str,
        configuration: &Configuration,
    ) -> anyhow::Result<Self> {
        let process = Process::new(node_id);
        match Self::start_components(process.clone(), store, node_id, configuration).await {
            Ok(worker) => Ok(worker),
            Err(err) => {
                process.shutdown("startup failed").await;
                Err(err)
            }
        }
    }

    async fn start_components(
        process: Arc<Process>,
        store: Arc<dyn KvStore>,
        node_id: &str,
        configuration: &Configuration,
    ) -> anyhow::Result<Self> {
        let ctx = process.ctx();

        let distribution = DistributionNode::start(
            &ctx,
            node_id,
            configuration.group(),
            store.clone(),
            process.as_ref(),
            configuration.distribution_config(),
        )
        .await
        .with_context(|| format!("cannot start distribution node \"{node_id}\""))?;
        LoggingListener::spawn(node_id, distribution.on_change_listener());

        let tasks = TaskNode::new(
            &ctx,
            node_id,
            store.clone(),
            Arc::new(SystemClock),
            process.as_ref(),
            configuration.task_node_config(),
        )
        .await
        .with_context(|| format!("cannot start task node \"{node_id}\""))?;

        let deps = OrchestratorDeps {
            store: store.clone(),
            distribution: distribution.clone(),
            tasks: tasks.clone(),
        };
        let config = trigger_orchestrator(store, configuration);
        orchestrator::start(&ctx, process.as_ref(), deps, config)
            .await
            .with_context(|| format!("cannot start orchestrator on \"{node_id}\""))?;

        info!(node = %node_id, "worker node started");
        Ok(Self {
            process,
            distribution,
            tasks,
        })
    }
}

fn trigger_orchestrator(store: Arc<dyn KvStore>, configuration: &Configuration) -> OrchestratorConfig<Trigger> {
    let timeout = configuration.task_timeout();
    OrchestratorConfig::new(
        TRIGGER_TASK_TYPE,
        Prefix::new(configuration.trigger_prefix()),
        |e: &WatchEntry<Trigger>| e.value.distribution_key(),
        |e: &WatchEntry<Trigger>| {
            TaskKey::new(
                e.value.project_id.to_string(),
                format!("{}/{}/{}", e.value.receiver_id, TRIGGER_TASK_TYPE, e.value.id),
            )
        },
        move || -> (Context, CancelHandle) { Context::background().with_timeout(timeout) },
        move |e: &WatchEntry<Trigger>| {
            let store = store.clone();
            let entry = e.clone();
            Some(task_fn(move |ctx| process_trigger(ctx, store, entry)))
        },
    )
    .with_restart_interval(configuration.restart_interval())
    .with_lock(|e: &WatchEntry<Trigger>| format!("{}/{}", e.value.distribution_key(), e.value.id))
}

async fn process_trigger(ctx: Context, store: Arc<dyn KvStore>, entry: WatchEntry<Trigger>) -> TaskResult {
    // Simulated work
    let size = entry.value.payload.to_string().len();
    if ctx.run(tokio::time::sleep(Duration::from_millis(10 + size as u64))).await.is_err() {
        return TaskResult::err(anyhow::anyhow!("processing of \"{}\" cancelled", entry.value.id));
    }

    match store.delete(&entry.key).await {
        Ok(_) => TaskResult::ok(format!("processed \"{}\"", entry.value.id)).with_output("payloadBytes", size),
        Err(err) => TaskResult::err(anyhow::Error::new(err).context("cannot delete trigger")),
    }
}
