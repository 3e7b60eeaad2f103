//! Task and task node configuration

use std::future::Future;
use std::time::Duration;

use convoy_common::{CancelHandle, Context, ConvoyError, Validation};
use futures::FutureExt;
use futures::future::BoxFuture;

use super::model::TaskKey;
use super::result::TaskResult;

/// Creates the context of one task run; it must carry a deadline.
pub type ContextFactory = Box<dyn FnOnce() -> (Context, CancelHandle) + Send>;

/// The task operation
pub type TaskFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, TaskResult> + Send>;

/// Boxes an async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

/// One task to run at most once in the cluster
pub struct TaskConfig {
    pub task_type: String,
    pub key: TaskKey,
    /// Lock name, defaults to the task key.
    pub lock: Option<String>,
    pub context: ContextFactory,
    pub operation: TaskFn,
}

impl TaskConfig {
    pub fn new<C>(task_type: impl Into<String>, key: TaskKey, context: C, operation: TaskFn) -> Self
    where
        C: FnOnce() -> (Context, CancelHandle) + Send + 'static,
    {
        Self {
            task_type: task_type.into(),
            key,
            lock: None,
            context: Box::new(context),
            operation,
        }
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn lock_name(&self) -> String {
        match &self.lock {
            Some(lock) if !lock.is_empty() => lock.clone(),
            _ => self.key.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), ConvoyError> {
        let mut v = Validation::new();
        v.check(!self.task_type.is_empty(), "task type must be configured")
            .check(!self.key.scope.is_empty(), "task scope must be configured")
            .check(!self.key.task_id.is_empty(), "task ID must be configured");
        v.finish()
    }
}

impl std::fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskConfig")
            .field("task_type", &self.task_type)
            .field("key", &self.key)
            .field("lock", &self.lock)
            .finish()
    }
}

/// Retention of task records
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Unfinished tasks older than this are deleted
    pub unfinished_after: Duration,
    pub successful_after: Duration,
    pub failed_after: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            unfinished_after: Duration::from_secs(7 * 24 * 3600),
            successful_after: Duration::from_secs(3600),
            failed_after: Duration::from_secs(24 * 3600),
        }
    }
}

/// Task node configuration
#[derive(Debug, Clone)]
pub struct TaskNodeConfig {
    /// Session TTL; a crashed node releases its locks after this time
    pub ttl: Duration,
    /// Maximum delay between finalization retries
    pub finalize_max_backoff: Duration,
    /// Span name prefix, the task type is appended
    pub span_prefix: String,
    pub cleanup: CleanupConfig,
}

impl Default for TaskNodeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            finalize_max_backoff: Duration::from_secs(2),
            span_prefix: "convoy.task.".to_string(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl TaskNodeConfig {
    pub fn validate(&self) -> Result<(), ConvoyError> {
        let mut v = Validation::new();
        v.check(self.ttl >= Duration::from_secs(1), "TTL must be at least 1s")
            .check(
                !self.finalize_max_backoff.is_zero(),
                "finalize max backoff must be > 0",
            );
        if self.cleanup.enabled {
            v.check(!self.cleanup.interval.is_zero(), "cleanup interval must be > 0");
        }
        v.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TaskConfig {
        TaskConfig::new(
            "some.task",
            TaskKey::new("123", "my-task"),
            || Context::background().with_timeout(Duration::from_secs(60)),
            task_fn(|_| async { TaskResult::ok("done") }),
        )
    }

    #[test]
    fn test_lock_name() {
        assert_eq!(config().lock_name(), "123/my-task");
        assert_eq!(config().with_lock("my-lock").lock_name(), "my-lock");
    }

    #[test]
    fn test_validation() {
        assert!(config().validate().is_ok());
        let mut invalid = config();
        invalid.task_type.clear();
        invalid.key.scope.clear();
        let err = invalid.validate().unwrap_err().to_string();
        assert!(err.contains("task type must be configured"));
        assert!(err.contains("task scope must be configured"));

        assert!(TaskNodeConfig::default().validate().is_ok());
    }
}
