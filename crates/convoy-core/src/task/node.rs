//! Task node: runs operations at most once in the whole cluster
//!
//! Uniqueness is guaranteed in two steps. A local admission map makes a
//! re-delivered task a cheap no-op on the node already running it. Across
//! nodes, the task record and the lock are created in one store transaction
//! which fails if the lock exists. The lock is bound to the node session
//! lease, so a crashed node releases its locks after the session TTL.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use convoy_common::{
    CancelHandle, Clock, Context, RetryBackoff, ShutdownHook, ShutdownRegistrar, UtcTime,
    random_id,
};
use convoy_store::{
    Compare, KvStore, Session, SessionBuilder, SessionConfig, StoreError, Txn, TxnOp, encode_json,
};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::cleanup;
use super::config::{TaskConfig, TaskFn, TaskNodeConfig};
use super::model::{FailureKind, TaskKey, TaskRecord};
use super::result::TaskResult;
use crate::error::TaskError;
use crate::{keys, metrics};

/// Result of an admission attempt
#[derive(Debug)]
pub enum Admission<T> {
    Started(T),
    /// The lock is already held by a task running on this node.
    AlreadyRunning,
    /// The lock is held by another node.
    LockInUse,
}

impl<T> Admission<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started(_))
    }

    pub fn started(self) -> Option<T> {
        match self {
            Admission::Started(v) => Some(v),
            _ => None,
        }
    }
}

/// Handle of a task running in the background
#[derive(Debug)]
pub struct StartedTask {
    key: TaskKey,
    lock: String,
    handle: JoinHandle<Result<TaskRecord, TaskError>>,
}

impl StartedTask {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Full key of the lock.
    pub fn lock(&self) -> &str {
        &self.lock
    }

    /// Waits until the task is finished and its record is written.
    pub async fn wait(self) -> Result<TaskRecord, TaskError> {
        self.handle
            .await
            .map_err(|e| TaskError::Aborted(e.to_string()))?
    }
}

/// Releases the local admission of a lock on drop.
struct LocalLock {
    node: Arc<TaskNode>,
    lock_key: String,
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        self.node.release_local(&self.lock_key);
    }
}

struct Run {
    record: TaskRecord,
    record_key: String,
    lock_key: String,
    task_ctx: Context,
    task_cancel: CancelHandle,
    operation: TaskFn,
    local: LocalLock,
}

pub struct TaskNode {
    node_id: String,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: TaskNodeConfig,
    session: Session,
    /// Cancelled on shutdown, stops new admissions.
    tasks_ctx: Context,
    tasks_cancel: CancelHandle,
    active: Mutex<HashSet<String>>,
    running: watch::Sender<usize>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl TaskNode {
    /// Creates the node session and registers the node shutdown.
    pub async fn new(
        ctx: &Context,
        node_id: impl Into<String>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        registrar: &dyn ShutdownRegistrar,
        config: TaskNodeConfig,
    ) -> Result<Arc<Self>, TaskError> {
        config.validate()?;
        let node_id = node_id.into();

        let session_config = SessionConfig {
            ttl: config.ttl,
            ..Default::default()
        };
        let session = SessionBuilder::new(session_config)
            .start(ctx, store.clone())
            .await?;

        let (tasks_ctx, tasks_cancel) = Context::background().with_cancel();
        let (running, _) = watch::channel(0);
        let node = Arc::new(Self {
            node_id,
            store,
            clock,
            config,
            session,
            tasks_ctx,
            tasks_cancel,
            active: Mutex::new(HashSet::new()),
            running,
            cleanup: Mutex::new(None),
        });

        let hook_node = node.clone();
        registrar.on_shutdown(ShutdownHook::new(move || async move {
            hook_node.shutdown().await;
        }));

        if node.config.cleanup.enabled {
            let handle = tokio::spawn(cleanup::run_periodically(node.clone()));
            *node.cleanup.lock() = Some(handle);
        }

        info!(node = %node.node_id, "task node ready");
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn config(&self) -> &TaskNodeConfig {
        &self.config
    }

    pub(crate) fn tasks_ctx(&self) -> &Context {
        &self.tasks_ctx
    }

    /// Number of tasks running on this node.
    pub fn tasks_count(&self) -> usize {
        *self.running.borrow()
    }

    fn acquire_local(self: &Arc<Self>, lock_key: &str) -> Option<LocalLock> {
        let mut active = self.active.lock();
        if !active.insert(lock_key.to_string()) {
            return None;
        }
        self.running.send_modify(|n| *n += 1);
        Some(LocalLock {
            node: self.clone(),
            lock_key: lock_key.to_string(),
        })
    }

    fn release_local(&self, lock_key: &str) {
        let mut active = self.active.lock();
        if active.remove(lock_key) {
            self.running.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Starts the task in the background, unless its lock is already taken.
    ///
    /// The task context is created first and must have a deadline.
    pub async fn start(self: &Arc<Self>, cfg: TaskConfig) -> Result<Admission<StartedTask>, TaskError> {
        cfg.validate()?;
        if self.tasks_ctx.is_done() {
            return Err(TaskError::ShuttingDown);
        }

        let lock_key = keys::task_locks().key(&cfg.lock_name());
        let TaskConfig {
            task_type,
            key,
            context,
            operation,
            ..
        } = cfg;

        let (task_ctx, task_cancel) = context();
        if task_ctx.deadline().is_none() {
            task_cancel.cancel();
            return Err(TaskError::MissingDeadline);
        }

        // Append the creation time and a random suffix to the task ID
        let created_at = UtcTime::from(self.clock.now());
        let task_key = TaskKey::new(
            key.scope,
            format!("{}/{}_{}", key.task_id, created_at, random_id(5)),
        );

        let Some(local) = self.acquire_local(&lock_key) else {
            info!(node = %self.node_id, task = %task_key, "task ignored, the lock \"{}\" is in use", lock_key);
            task_cancel.cancel();
            return Ok(Admission::AlreadyRunning);
        };

        let start_failed = |source: StoreError| TaskError::StartFailed {
            key: task_key.to_string(),
            source,
        };

        let record = TaskRecord {
            key: task_key.clone(),
            task_type: task_type.clone(),
            created_at,
            finished_at: None,
            node: self.node_id.clone(),
            lock: lock_key.clone(),
            result: None,
            error: None,
            error_kind: None,
            outputs: Default::default(),
            duration: None,
        };
        let record_key = keys::tasks().key(&task_key.to_string());
        let lease = self.session.lease_id().map_err(start_failed)?;
        let value = encode_json(&record_key, &record).map_err(start_failed)?;

        let txn = Txn::new()
            .when(Compare::NotExists(lock_key.clone()))
            .then(TxnOp::put(record_key.clone(), value))
            .then(TxnOp::put_with_lease(lock_key.clone(), self.node_id.clone(), lease));
        let resp = self
            .tasks_ctx
            .run(self.store.txn(txn))
            .await
            .map_err(StoreError::from)
            .and_then(|r| r)
            .map_err(start_failed)?;
        if !resp.succeeded {
            info!(node = %self.node_id, task = %task_key, "task ignored, the lock \"{}\" is in use", lock_key);
            task_cancel.cancel();
            return Ok(Admission::LockInUse);
        }

        info!(node = %self.node_id, task = %task_key, "started task");
        debug!(node = %self.node_id, task = %task_key, "lock acquired \"{}\"", lock_key);
        metrics::record_task_started(&task_type);

        let span = info_span!(
            "task",
            otel.name = %format!("{}{}", self.config.span_prefix, task_type),
            node = %self.node_id,
            task = %task_key,
            task_type = %task_type,
            lock = %lock_key,
            created_at = %created_at,
        );
        let run = Run {
            record,
            record_key,
            lock_key: lock_key.clone(),
            task_ctx,
            task_cancel,
            operation,
            local,
        };
        let node = self.clone();
        let handle = tokio::spawn(async move { node.execute(run).await }.instrument(span));

        Ok(Admission::Started(StartedTask {
            key: task_key,
            lock: lock_key,
            handle,
        }))
    }

    /// Starts the task and waits for its record.
    pub async fn run(self: &Arc<Self>, cfg: TaskConfig) -> Result<Admission<TaskRecord>, TaskError> {
        match self.start(cfg).await? {
            Admission::Started(task) => Ok(Admission::Started(task.wait().await?)),
            Admission::AlreadyRunning => Ok(Admission::AlreadyRunning),
            Admission::LockInUse => Ok(Admission::LockInUse),
        }
    }

    pub async fn get_task(&self, key: &TaskKey) -> Result<Option<TaskRecord>, TaskError> {
        let kv = self.store.get(&keys::tasks().key(&key.to_string())).await?;
        Ok(kv.map(|kv| kv.decode()).transpose()?)
    }

    /// All task records of the scope.
    pub async fn list_tasks(&self, scope: &str) -> Result<Vec<TaskRecord>, TaskError> {
        let prefix = keys::tasks().add(scope);
        let resp = self.store.get_prefix(prefix.as_str()).await?;
        resp.kvs
            .iter()
            .map(|kv| kv.decode().map_err(TaskError::from))
            .collect()
    }

    async fn execute(self: Arc<Self>, run: Run) -> Result<TaskRecord, TaskError> {
        let Run {
            mut record,
            record_key,
            lock_key,
            task_ctx,
            task_cancel,
            operation,
            local,
        } = run;

        let result = match AssertUnwindSafe(async move { operation(task_ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("task panic: {}", message);
                TaskResult::panic(message)
            }
        };
        task_cancel.cancel();
        let finished_at = self.clock.now();
        let duration = (finished_at - record.created_at.as_datetime())
            .to_std()
            .unwrap_or_default();

        let is_success = result.is_success();
        let error_kind = match result.failure_kind() {
            None | Some(FailureKind::Expected) => "",
            Some(kind) => kind.as_str(),
        };
        metrics::record_task_finished(&record.task_type, is_success, error_kind, duration);

        let (outcome, outputs) = result.into_parts();
        record.finished_at = Some(UtcTime::from(finished_at));
        record.duration = Some(duration);
        record.outputs = outputs;
        let outputs_msg = if record.outputs.is_empty() {
            String::new()
        } else {
            format!(
                " outputs: {}",
                serde_json::to_string(&record.outputs).unwrap_or_default()
            )
        };
        match outcome {
            Ok(message) => {
                info!("task succeeded ({:?}): {}{}", duration, message, outputs_msg);
                record.result = Some(message);
            }
            Err((kind, err)) => {
                warn!("task failed ({:?}): {:#}{}", duration, err, outputs_msg);
                record.error = Some(format!("{:#}", err));
                record.error_kind = Some(kind);
            }
        }

        let finalized = self.finalize(&record, &record_key, &lock_key).await;
        drop(local);
        finalized.map(|_| record)
    }

    /// Writes the final record and releases the lock in one transaction.
    ///
    /// Bounded by the session TTL, after which the lease expires anyway.
    async fn finalize(&self, record: &TaskRecord, record_key: &str, lock_key: &str) -> Result<(), TaskError> {
        let value = encode_json(record_key, record).map_err(TaskError::Finalize)?;
        let (ctx, _cancel) = Context::background().with_timeout(self.config.ttl);
        let mut backoff = RetryBackoff::new(Duration::from_millis(50), self.config.finalize_max_backoff);

        loop {
            let txn = Txn::new()
                .when(Compare::ValueEquals(
                    lock_key.to_string(),
                    self.node_id.clone().into_bytes(),
                ))
                .then(TxnOp::put(record_key, value.clone()))
                .then(TxnOp::delete(lock_key));

            let err = match ctx.run(self.store.txn(txn)).await {
                Ok(Ok(resp)) if resp.succeeded => {
                    debug!("lock released \"{}\"", lock_key);
                    return Ok(());
                }
                Ok(Ok(_)) => {
                    error!("cannot release task lock \"{}\", not found", lock_key);
                    return Err(TaskError::LockNotFound(lock_key.to_string()));
                }
                Ok(Err(err)) => err,
                Err(ctx_err) => StoreError::from(ctx_err),
            };

            if !err.is_retryable() {
                error!("cannot update task and release lock: {}", err);
                return Err(TaskError::Finalize(err));
            }
            let delay = backoff.next_backoff();
            warn!("cannot update task and release lock, retrying in {:?}: {}", delay, err);
            if ctx.run(tokio::time::sleep(delay)).await.is_err() {
                error!("cannot update task and release lock: {}", err);
                return Err(TaskError::Finalize(err));
            }
        }
    }

    async fn shutdown(&self) {
        info!(node = %self.node_id, "received shutdown request");
        self.tasks_cancel.cancel();

        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            let _ = cleanup.await;
        }

        let count = self.tasks_count();
        if count > 0 {
            info!(node = %self.node_id, "waiting for \"{}\" tasks to be finished", count);
        }
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;

        self.session.close().await;
        info!(node = %self.node_id, "shutdown done");
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("node_id", &self.node_id)
            .field("tasks_count", &self.tasks_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::config::task_fn;
    use convoy_common::{MockClock, Process};
    use convoy_store::MemoryStore;

    fn node_config() -> TaskNodeConfig {
        let mut config = TaskNodeConfig::default();
        config.cleanup.enabled = false;
        config
    }

    async fn create_node(store: Arc<MemoryStore>, process: &Process, node_id: &str) -> Arc<TaskNode> {
        TaskNode::new(
            &Context::background(),
            node_id,
            store,
            Arc::new(MockClock::default()),
            process,
            node_config(),
        )
        .await
        .unwrap()
    }

    fn with_deadline() -> (Context, CancelHandle) {
        Context::background().with_timeout(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_missing_deadline_is_rejected_before_admission() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let node = create_node(store.clone(), &process, "node1").await;

        let cfg = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "my-task"),
            || Context::background().with_cancel(),
            task_fn(|_| async { TaskResult::ok("never") }),
        );
        assert_eq!(node.start(cfg).await.unwrap_err(), TaskError::MissingDeadline);
        assert_eq!(node.tasks_count(), 0);
        assert!(store.get_prefix("task/").await.unwrap().kvs.is_empty());

        process.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_local_admission() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let node = create_node(store.clone(), &process, "node1").await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "my-task"),
            with_deadline,
            task_fn(|_| async move {
                let _ = release_rx.await;
                TaskResult::ok("done")
            }),
        );
        let started = node.start(first).await.unwrap().started().unwrap();
        assert_eq!(node.tasks_count(), 1);

        let second = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "my-task"),
            with_deadline,
            task_fn(|_| async { TaskResult::ok("second") }),
        );
        assert!(matches!(node.start(second).await.unwrap(), Admission::AlreadyRunning));

        release_tx.send(()).unwrap();
        let record = started.wait().await.unwrap();
        assert_eq!(record.result.as_deref(), Some("done"));
        assert_eq!(node.tasks_count(), 0);
        assert!(store.get("runtime/lock/task/123/my-task").await.unwrap().is_none());

        process.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_user_error_is_recorded_as_expected() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let node = create_node(store.clone(), &process, "node1").await;

        let cfg = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "my-task"),
            with_deadline,
            task_fn(|_| async {
                TaskResult::user_err(anyhow::anyhow!("invalid input")).with_output("key", "value")
            }),
        );
        let record = node.run(cfg).await.unwrap().started().unwrap();
        assert_eq!(record.error.as_deref(), Some("invalid input"));
        assert_eq!(record.error_kind, Some(FailureKind::Expected));
        assert_eq!(record.outputs["key"], serde_json::json!("value"));

        let stored = node.get_task(&record.key).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(node.list_tasks("123").await.unwrap(), vec![record]);

        process.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_duration_is_measured_by_clock() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let clock = MockClock::default();
        let node = TaskNode::new(
            &Context::background(),
            "node1",
            store,
            Arc::new(clock.clone()),
            process.as_ref(),
            node_config(),
        )
        .await
        .unwrap();

        let cfg = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "timed"),
            with_deadline,
            task_fn(move |_| async move {
                clock.advance(Duration::from_secs(90));
                TaskResult::ok("done")
            }),
        );
        let record = node.run(cfg).await.unwrap().started().unwrap();
        assert_eq!(record.duration, Some(Duration::from_secs(90)));
        let finished_at = record.finished_at.unwrap().as_datetime();
        assert_eq!(
            (finished_at - record.created_at.as_datetime()).to_std().unwrap(),
            Duration::from_secs(90)
        );

        process.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_task() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let node = create_node(store.clone(), &process, "node1").await;

        let cfg = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "slow"),
            with_deadline,
            task_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                TaskResult::ok("finished")
            }),
        );
        let key = node.start(cfg).await.unwrap().started().unwrap().key().clone();

        process.shutdown("test done").await;
        let record = node.get_task(&key).await.unwrap().unwrap();
        assert!(record.is_successful());
        assert_eq!(node.tasks_count(), 0);

        let late = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "late"),
            with_deadline,
            task_fn(|_| async { TaskResult::ok("late") }),
        );
        assert_eq!(node.start(late).await.unwrap_err(), TaskError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_lock_lost_while_running() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let node = create_node(store.clone(), &process, "node1").await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let cfg = TaskConfig::new(
            "some.task",
            TaskKey::new("123", "my-task"),
            with_deadline,
            task_fn(|_| async move {
                let _ = release_rx.await;
                TaskResult::ok("done")
            }),
        )
        .with_lock("my-lock");
        let task = node.start(cfg).await.unwrap().started().unwrap();
        assert_eq!(task.lock(), "runtime/lock/task/my-lock");

        // the lock disappears, e.g. the lease expired during an outage
        store.delete("runtime/lock/task/my-lock").await.unwrap();
        release_tx.send(()).unwrap();

        assert_eq!(
            task.wait().await.unwrap_err(),
            TaskError::LockNotFound("runtime/lock/task/my-lock".to_string())
        );
        assert_eq!(node.tasks_count(), 0);

        process.shutdown("test done").await;
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
