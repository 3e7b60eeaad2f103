use std::sync::Arc;
use std::time::Duration;

use convoy_common::{CancelHandle, Context, ConvoyError, Validation};
use convoy_store::{KeyValue, Prefix, Revision};

use crate::task::{TaskFn, TaskKey};

/// A decoded entry created under the watched prefix
#[derive(Debug, Clone)]
pub struct WatchEntry<T> {
    pub key: String,
    pub value: T,
    pub revision: Revision,
}

impl<T> WatchEntry<T> {
    pub(crate) fn new(kv: &KeyValue, value: T) -> Self {
        Self {
            key: kv.key.clone(),
            value,
            revision: kv.mod_revision,
        }
    }
}

pub type EntryFn<T, R> = Box<dyn Fn(&WatchEntry<T>) -> R + Send + Sync>;

/// Returns `Err(reason)` to skip the entry.
pub type StartGuard<T> = Box<dyn Fn(&WatchEntry<T>) -> Result<(), String> + Send + Sync>;

/// Returns `None` to decline the entry.
pub type TaskFactory<T> = Box<dyn Fn(&WatchEntry<T>) -> Option<TaskFn> + Send + Sync>;

pub type SharedContextFactory = Arc<dyn Fn() -> (Context, CancelHandle) + Send + Sync>;

/// Turns entries created under a prefix into tasks
pub struct OrchestratorConfig<T> {
    /// Used as the task type.
    pub name: String,
    pub prefix: Prefix,
    /// The watch is restarted periodically, re-delivering all entries.
    pub restart_interval: Duration,
    pub distribution_key: EntryFn<T, String>,
    pub lock: Option<EntryFn<T, String>>,
    pub task_key: EntryFn<T, TaskKey>,
    pub start_task_if: Option<StartGuard<T>>,
    /// Each task context must have a deadline.
    pub task_ctx: SharedContextFactory,
    pub task_factory: TaskFactory<T>,
}

impl<T> OrchestratorConfig<T> {
    pub fn new<D, K, C, F>(
        name: impl Into<String>,
        prefix: Prefix,
        distribution_key: D,
        task_key: K,
        task_ctx: C,
        task_factory: F,
    ) -> Self
    where
        D: Fn(&WatchEntry<T>) -> String + Send + Sync + 'static,
        K: Fn(&WatchEntry<T>) -> TaskKey + Send + Sync + 'static,
        C: Fn() -> (Context, CancelHandle) + Send + Sync + 'static,
        F: Fn(&WatchEntry<T>) -> Option<TaskFn> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            prefix,
            restart_interval: Duration::from_secs(60),
            distribution_key: Box::new(distribution_key),
            lock: None,
            task_key: Box::new(task_key),
            start_task_if: None,
            task_ctx: Arc::new(task_ctx),
            task_factory: Box::new(task_factory),
        }
    }

    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }

    pub fn with_lock<L>(mut self, lock: L) -> Self
    where
        L: Fn(&WatchEntry<T>) -> String + Send + Sync + 'static,
    {
        self.lock = Some(Box::new(lock));
        self
    }

    pub fn with_start_task_if<G>(mut self, guard: G) -> Self
    where
        G: Fn(&WatchEntry<T>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.start_task_if = Some(Box::new(guard));
        self
    }

    pub fn validate(&self) -> Result<(), ConvoyError> {
        let mut v = Validation::new();
        v.check(!self.name.is_empty(), "orchestrator name must be configured")
            .check(
                self.prefix.as_str() != "/",
                "source watch prefix definition must be configured",
            )
            .check(
                !self.restart_interval.is_zero(),
                "restart interval must be configured",
            );
        v.finish()
    }
}

impl<T> std::fmt::Debug for OrchestratorConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("name", &self.name)
            .field("prefix", &self.prefix.as_str())
            .field("restart_interval", &self.restart_interval)
            .finish()
    }
}
