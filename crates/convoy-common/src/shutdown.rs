//! Process lifetime and ordered shutdown hooks
//!
//! Components register their cleanup through a [`ShutdownRegistrar`]. Hooks run
//! sequentially in reverse registration order, so a component started later
//! (an orchestrator) stops before the components it depends on (the task node,
//! the session).

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::{CancelHandle, Context};

/// One cleanup step executed on shutdown
pub struct ShutdownHook(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>);

impl ShutdownHook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move || f().boxed()))
    }

    pub async fn run(self) {
        (self.0)().await
    }
}

impl std::fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShutdownHook")
    }
}

pub trait ShutdownRegistrar: Send + Sync {
    fn on_shutdown(&self, hook: ShutdownHook);
}

/// Owns the process lifetime context and the registered shutdown hooks.
pub struct Process {
    unique_id: String,
    hooks: Mutex<Vec<ShutdownHook>>,
    ctx: Context,
    cancel: CancelHandle,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

impl Process {
    pub fn new(unique_id: impl Into<String>) -> Arc<Self> {
        let (ctx, cancel) = Context::background().with_cancel();
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            unique_id: unique_id.into(),
            hooks: Mutex::new(Vec::new()),
            ctx,
            cancel,
            started: AtomicBool::new(false),
            done,
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Context cancelled after all shutdown hooks have finished.
    pub fn ctx(&self) -> Context {
        self.ctx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Runs the shutdown hooks once; concurrent callers wait for the first one.
    pub async fn shutdown(&self, reason: impl Display) {
        if self.started.swap(true, Ordering::SeqCst) {
            self.wait_for_shutdown().await;
            return;
        }

        info!(process = %self.unique_id, "exiting ({})", reason);

        let hooks = std::mem::take(&mut *self.hooks.lock());
        debug!(process = %self.unique_id, "running {} shutdown hooks", hooks.len());
        for hook in hooks.into_iter().rev() {
            hook.run().await;
        }

        self.cancel.cancel();
        self.done.send_replace(true);
        info!(process = %self.unique_id, "exited");
    }

    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl ShutdownRegistrar for Process {
    fn on_shutdown(&self, hook: ShutdownHook) {
        self.hooks.lock().push(hook);
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("unique_id", &self.unique_id)
            .field("hooks", &self.hooks.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hooks_run_in_reverse_order() {
        let process = Process::new("test-node");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=3 {
            let order = order.clone();
            process.on_shutdown(ShutdownHook::new(move || async move {
                order.lock().push(i);
            }));
        }

        assert!(!process.ctx().is_done());
        process.shutdown("test").await;

        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert!(process.ctx().is_done());
        assert!(process.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let process = Process::new("test-node");
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        process.on_shutdown(ShutdownHook::new(move || async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            *c.lock() += 1;
        }));

        let p1 = process.clone();
        let first = tokio::spawn(async move { p1.shutdown("first").await });
        process.shutdown("second").await;
        first.await.unwrap();

        assert_eq!(*calls.lock(), 1);
        process.wait_for_shutdown().await;
    }
}
