//! Orchestrator: turns entries created under a prefix into cluster-unique tasks
//!
//! Each node watches the same prefix and starts only the tasks the assigner
//! maps to it. The watch is restarted periodically and whenever the group
//! membership changes, so failed entries are retried and ownership is
//! re-evaluated. Task admission stays idempotent per lock, so re-delivered
//! entries are harmless.

mod config;

pub use config::{
    EntryFn, OrchestratorConfig, SharedContextFactory, StartGuard, TaskFactory, WatchEntry,
};

use std::sync::Arc;

use convoy_common::{CancelHandle, Context, RetryBackoff, ShutdownHook, ShutdownRegistrar};
use convoy_store::{EventType, KvStore, StoreError, WatchResponse, get_all_and_watch};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::distribution::{ChangeEvents, DistributionNode, Listener};
use crate::error::OrchestratorError;
use crate::task::{TaskConfig, TaskNode};

/// Components the orchestrator works with
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn KvStore>,
    pub distribution: Arc<DistributionNode>,
    pub tasks: Arc<TaskNode>,
}

/// Handle of a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
    cancel: CancelHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OrchestratorHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Cancels the watch and waits for the loop to exit.
    ///
    /// Tasks already started are drained by the task node.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Starts the orchestrator.
///
/// Returns after the first snapshot of the prefix was loaded; an error in
/// this first iteration is returned, later errors are retried with backoff.
pub async fn start<T>(
    ctx: &Context,
    registrar: &dyn ShutdownRegistrar,
    deps: OrchestratorDeps,
    config: OrchestratorConfig<T>,
) -> Result<OrchestratorHandle, OrchestratorError>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    config.validate()?;
    let name = config.name.clone();
    let (loop_ctx, cancel) = ctx.with_cancel();
    let listener = deps.distribution.on_change_listener();
    let (init_tx, init_rx) = oneshot::channel();

    let span = info_span!("orchestrator", task = %name, node = %deps.distribution.node_id());
    let orchestrator = Orchestrator { config, deps };
    let worker = tokio::spawn(orchestrator.run(loop_ctx, listener, init_tx).instrument(span));

    let init = match init_rx.await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Cancelled),
    };
    if let Err(source) = init {
        cancel.cancel();
        let _ = worker.await;
        return Err(OrchestratorError::StartFailed { name, source });
    }

    let handle = OrchestratorHandle {
        inner: Arc::new(HandleInner {
            name,
            cancel,
            worker: Mutex::new(Some(worker)),
        }),
    };
    let hook = handle.clone();
    registrar.on_shutdown(ShutdownHook::new(move || async move {
        hook.stop().await;
    }));
    Ok(handle)
}

enum IterationEnd {
    Stopped,
    Restart,
    Failed(StoreError),
}

enum Step {
    Stop,
    Restart,
    Changes(Option<ChangeEvents>),
    Item(Option<Result<WatchResponse, StoreError>>),
}

type InitSender = oneshot::Sender<Result<(), StoreError>>;

struct Orchestrator<T> {
    config: OrchestratorConfig<T>,
    deps: OrchestratorDeps,
}

impl<T> Orchestrator<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(self, ctx: Context, listener: Listener, init_tx: InitSender) {
        let mut init = Some(init_tx);
        let mut listener = Some(listener);
        let mut backoff = RetryBackoff::default();

        loop {
            if init.is_none() {
                debug!("restart");
            }
            match self.watch(&ctx, &mut listener, &mut init).await {
                IterationEnd::Stopped => break,
                IterationEnd::Restart => backoff.reset(),
                IterationEnd::Failed(err) => {
                    if let Some(init) = init.take() {
                        let _ = init.send(Err(err));
                        break;
                    }
                    let delay = backoff.next_backoff();
                    warn!("re-creating watcher, backoff delay {:?}, reason: {}", delay, err);
                    if ctx.run(tokio::time::sleep(delay)).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("stopped");
    }

    /// One watch iteration, until restart, stop or failure.
    async fn watch(
        &self,
        ctx: &Context,
        listener: &mut Option<Listener>,
        init: &mut Option<InitSender>,
    ) -> IterationEnd {
        let (watch_ctx, watch_cancel) = ctx.with_cancel();
        let mut stream = get_all_and_watch(
            self.deps.store.clone(),
            self.config.prefix.as_str(),
            watch_ctx,
        );
        let restart = tokio::time::sleep(self.config.restart_interval);
        tokio::pin!(restart);
        let stop = ctx.done();
        tokio::pin!(stop);

        let end = loop {
            let step = tokio::select! {
                biased;
                _ = &mut stop => Step::Stop,
                _ = &mut restart => Step::Restart,
                events = next_change(listener) => Step::Changes(events),
                item = stream.next() => Step::Item(item),
            };

            match step {
                Step::Stop => break IterationEnd::Stopped,
                Step::Restart => break IterationEnd::Restart,
                Step::Changes(Some(events)) => {
                    debug!("distribution changed: {}", events);
                    break IterationEnd::Restart;
                }
                // The distribution node is shutting down
                Step::Changes(None) => *listener = None,
                Step::Item(Some(Ok(resp))) => {
                    if let Some(init) = init.take() {
                        info!("ready");
                        let _ = init.send(Ok(()));
                    }
                    self.handle(&resp).await;
                }
                Step::Item(Some(Err(err))) => break IterationEnd::Failed(err),
                Step::Item(None) if ctx.is_done() => break IterationEnd::Stopped,
                Step::Item(None) => break IterationEnd::Failed(StoreError::Closed),
            }
        };
        watch_cancel.cancel();
        end
    }

    async fn handle(&self, resp: &WatchResponse) {
        for event in &resp.events {
            // Only new entries trigger tasks
            if event.kind != EventType::Create {
                continue;
            }
            let value: T = match event.kv.decode() {
                Ok(value) => value,
                Err(err) => {
                    warn!("skipped entry: {}", err);
                    continue;
                }
            };
            self.start_task(WatchEntry::new(&event.kv, value)).await;
        }
    }

    async fn start_task(&self, entry: WatchEntry<T>) {
        let task_key = (self.config.task_key)(&entry);
        let distribution_key = (self.config.distribution_key)(&entry);

        if !self.deps.distribution.is_owner(&distribution_key) {
            debug!(
                "not assigned \"{}\", distribution key \"{}\"",
                task_key, distribution_key
            );
            return;
        }

        if let Some(start_task_if) = &self.config.start_task_if {
            if let Err(reason) = start_task_if(&entry) {
                debug!("skipped \"{}\", {}", task_key, reason);
                return;
            }
        }

        let Some(operation) = (self.config.task_factory)(&entry) else {
            info!("skipped \"{}\"", task_key);
            return;
        };

        info!("assigned \"{}\"", task_key);
        let task_ctx = self.config.task_ctx.clone();
        let mut cfg = TaskConfig::new(self.config.name.clone(), task_key, move || task_ctx(), operation);
        if let Some(lock) = &self.config.lock {
            cfg = cfg.with_lock(lock(&entry));
        }
        if let Err(err) = self.deps.tasks.start(cfg).await {
            error!("{}", err);
        }
    }
}

async fn next_change(listener: &mut Option<Listener>) -> Option<ChangeEvents> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::distribution::DistributionConfig;
    use crate::task::{TaskKey, TaskNodeConfig, TaskResult, task_fn};
    use convoy_common::{MockClock, Process};
    use convoy_store::{MemoryStore, Prefix};
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    struct Resource {
        receiver: String,
        id: String,
    }

    async fn deps(store: Arc<MemoryStore>, process: &Process) -> OrchestratorDeps {
        let ctx = Context::background();
        let distribution = DistributionNode::start(
            &ctx,
            "node1",
            "workers",
            store.clone(),
            process,
            DistributionConfig {
                events_group_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut task_config = TaskNodeConfig::default();
        task_config.cleanup.enabled = false;
        let tasks = TaskNode::new(
            &ctx,
            "node1",
            store.clone(),
            Arc::new(MockClock::default()),
            process,
            task_config,
        )
        .await
        .unwrap();
        OrchestratorDeps {
            store,
            distribution,
            tasks,
        }
    }

    fn config() -> OrchestratorConfig<Resource> {
        OrchestratorConfig::new(
            "some.task",
            Prefix::new("my/prefix"),
            |e: &WatchEntry<Resource>| e.value.receiver.clone(),
            |e: &WatchEntry<Resource>| TaskKey::new("1000", format!("{}/some.task/{}", e.value.receiver, e.value.id)),
            || Context::background().with_timeout(Duration::from_secs(60)),
            |e: &WatchEntry<Resource>| {
                let id = e.value.id.clone();
                Some(task_fn(move |_| async move { TaskResult::ok(id) }))
            },
        )
    }

    async fn wait_for_tasks(deps: &OrchestratorDeps, count: usize) -> Vec<crate::task::TaskRecord> {
        for _ in 0..200 {
            let records = deps.tasks.list_tasks("1000").await.unwrap();
            if records.len() >= count && records.iter().all(|r| r.is_finished()) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timeout waiting for {count} tasks");
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut invalid = config().with_restart_interval(Duration::ZERO);
        invalid.name.clear();
        invalid.prefix = Prefix::new("");
        let err = invalid.validate().unwrap_err().to_string();
        assert!(err.contains("orchestrator name must be configured"));
        assert!(err.contains("source watch prefix definition must be configured"));
        assert!(err.contains("restart interval must be configured"));
    }

    #[tokio::test]
    async fn test_start_guard_and_declined_entries() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let deps = deps(store.clone(), &process).await;

        let config = config()
            .with_start_task_if(|e: &WatchEntry<Resource>| {
                if e.value.id == "BadID" {
                    Err("condition evaluated as false".to_string())
                } else {
                    Ok(())
                }
            })
            .with_lock(|e: &WatchEntry<Resource>| format!("{}/{}", e.value.receiver, e.value.id));
        let handle = start(&Context::background(), process.as_ref(), deps.clone(), config)
            .await
            .unwrap();
        assert_eq!(handle.name(), "some.task");

        for (key, id) in [("key1", "BadID"), ("key2", "GoodID")] {
            let value = format!(r#"{{"receiver":"my-receiver","id":"{id}"}}"#);
            store
                .put(&format!("my/prefix/{key}"), value.into_bytes(), None)
                .await
                .unwrap();
        }

        let records = wait_for_tasks(&deps, 1).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result.as_deref(), Some("GoodID"));
        assert_eq!(records[0].task_type, "some.task");
        assert_eq!(records[0].lock, "runtime/lock/task/my-receiver/GoodID");
        assert!(records[0].key.task_id.starts_with("my-receiver/some.task/GoodID/"));

        process.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_restart_redelivers_entries() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let deps = deps(store.clone(), &process).await;

        store
            .put(
                "my/prefix/key1",
                br#"{"receiver":"my-receiver","id":"ResourceID1"}"#.to_vec(),
                None,
            )
            .await
            .unwrap();

        let config = config().with_restart_interval(Duration::from_millis(50));
        start(&Context::background(), process.as_ref(), deps.clone(), config)
            .await
            .unwrap();

        // the entry is in the snapshot of each restart
        let records = wait_for_tasks(&deps, 2).await;
        assert!(records.iter().all(|r| r.result.as_deref() == Some("ResourceID1")));

        process.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_first_iteration_error_is_returned() {
        let store = MemoryStore::new();
        let process = Process::new("test");
        let deps = deps(store.clone(), &process).await;

        store.set_available(false);
        let err = start(&Context::background(), process.as_ref(), deps, config())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::StartFailed {
                name: "some.task".to_string(),
                source: StoreError::Unavailable,
            }
        );

        store.set_available(true);
        process.shutdown("test done").await;
    }
}
