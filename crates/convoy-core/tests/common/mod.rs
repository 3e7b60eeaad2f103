//! Shared helpers of the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use convoy_common::{CancelHandle, Context, MockClock, Process};
use convoy_core::distribution::{DistributionConfig, DistributionNode};
use convoy_core::task::{TaskNode, TaskNodeConfig};
use convoy_core::OrchestratorDeps;
use convoy_store::MemoryStore;

pub const GROUP: &str = "workers";

/// One simulated process of the cluster
pub struct TestNode {
    pub process: Arc<Process>,
    pub deps: OrchestratorDeps,
}

impl TestNode {
    pub async fn start(store: &Arc<MemoryStore>, node_id: &str) -> Self {
        let process = Process::new(node_id);
        let ctx = Context::background();
        let distribution = DistributionNode::start(
            &ctx,
            node_id,
            GROUP,
            store.clone(),
            process.as_ref(),
            distribution_config(),
        )
        .await
        .unwrap();
        let tasks = task_node(store, &process, node_id).await;
        Self {
            process,
            deps: OrchestratorDeps {
                store: store.clone(),
                distribution,
                tasks,
            },
        }
    }

    pub async fn shutdown(&self) {
        self.process.shutdown("test done").await;
    }
}

pub fn distribution_config() -> DistributionConfig {
    DistributionConfig {
        events_group_interval: Duration::ZERO,
        ..Default::default()
    }
}

pub fn task_node_config() -> TaskNodeConfig {
    let mut config = TaskNodeConfig::default();
    config.cleanup.enabled = false;
    config
}

pub async fn task_node(store: &Arc<MemoryStore>, process: &Process, node_id: &str) -> Arc<TaskNode> {
    task_node_with(store, process, node_id, task_node_config()).await
}

pub async fn task_node_with(
    store: &Arc<MemoryStore>,
    process: &Process,
    node_id: &str,
    config: TaskNodeConfig,
) -> Arc<TaskNode> {
    TaskNode::new(
        &Context::background(),
        node_id,
        store.clone(),
        Arc::new(MockClock::default()),
        process,
        config,
    )
    .await
    .unwrap()
}

pub fn task_ctx() -> (Context, CancelHandle) {
    Context::background().with_timeout(Duration::from_secs(60))
}

/// Polls `check` until it returns true, panics after 5s.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
