//! Periodic deletion of old task records
//!
//! The sweep itself runs as a task under a cluster-wide lock, so only one
//! node cleans up at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_common::{Clock, Context};
use convoy_store::{Compare, KvStore, Txn, TxnOp};
use tracing::{debug, info, warn};

use super::config::{CleanupConfig, TaskConfig, task_fn};
use super::model::{TaskKey, TaskRecord};
use super::node::{Admission, TaskNode};
use super::result::TaskResult;
use crate::error::TaskError;
use crate::keys;

pub const CLEANUP_TASK_TYPE: &str = "tasks.cleanup";

const CLEANUP_SCOPE: &str = "_system";
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(300);

/// Checks whether the record is old enough to be deleted.
///
/// Unfinished tasks are measured from creation, finished ones from the end.
pub fn should_delete(record: &TaskRecord, now: DateTime<Utc>, config: &CleanupConfig) -> bool {
    let (since, max_age) = match &record.finished_at {
        None => (record.created_at.as_datetime(), config.unfinished_after),
        Some(finished_at) if record.error.is_none() => {
            (finished_at.as_datetime(), config.successful_after)
        }
        Some(finished_at) => (finished_at.as_datetime(), config.failed_after),
    };
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) => now - since > max_age,
        Err(_) => false,
    }
}

/// Deletes expired records, each only if not modified meanwhile.
async fn sweep(
    ctx: Context,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: CleanupConfig,
) -> TaskResult {
    let resp = match ctx.run(store.get_prefix(keys::tasks().as_str())).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => return TaskResult::err(anyhow::Error::new(err).context("cannot load tasks")),
        Err(err) => return TaskResult::err(anyhow::Error::new(err).context("cannot load tasks")),
    };

    let now = clock.now();
    let mut deleted = 0usize;
    for kv in &resp.kvs {
        let record: TaskRecord = match kv.decode() {
            Ok(record) => record,
            Err(err) => {
                warn!("skipped task record: {}", err);
                continue;
            }
        };
        if !should_delete(&record, now, &config) {
            continue;
        }

        let txn = Txn::new()
            .when(Compare::ModRevisionEquals(kv.key.clone(), kv.mod_revision))
            .then(TxnOp::delete(kv.key.clone()));
        match ctx.run(store.txn(txn)).await {
            Ok(Ok(resp)) if resp.succeeded => {
                debug!("deleted task \"{}\"", record.key);
                deleted += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                return TaskResult::err(anyhow::Error::new(err).context("cannot delete task"))
                    .with_output("deletedTasksCount", deleted);
            }
            Err(err) => {
                return TaskResult::err(anyhow::Error::new(err).context("cannot delete task"))
                    .with_output("deletedTasksCount", deleted);
            }
        }
    }

    info!("deleted \"{}\" tasks", deleted);
    TaskResult::ok(format!("deleted \"{}\" tasks", deleted)).with_output("deletedTasksCount", deleted)
}

fn cleanup_task(node: &TaskNode) -> TaskConfig {
    let store = node.store();
    let clock = node.clock();
    let config = node.config().cleanup.clone();
    TaskConfig::new(
        CLEANUP_TASK_TYPE,
        TaskKey::new(CLEANUP_SCOPE, CLEANUP_TASK_TYPE),
        || Context::background().with_timeout(CLEANUP_TIMEOUT),
        task_fn(move |ctx| sweep(ctx, store, clock, config)),
    )
    .with_lock(CLEANUP_TASK_TYPE)
}

impl TaskNode {
    /// Runs the cleanup now and waits for it, unless another node is cleaning up.
    pub async fn cleanup(self: &Arc<Self>) -> Result<Admission<TaskRecord>, TaskError> {
        self.run(cleanup_task(self)).await
    }
}

pub(crate) async fn run_periodically(node: Arc<TaskNode>) {
    let interval = node.config().cleanup.interval;
    loop {
        if node.tasks_ctx().run(tokio::time::sleep(interval)).await.is_err() {
            return;
        }
        match node.start(cleanup_task(&node)).await {
            Ok(_) => {}
            Err(TaskError::ShuttingDown) => return,
            Err(err) => warn!("cannot start cleanup: {}", err),
        }
    }
}
