//! Cancellation and deadline propagation
//!
//! A [`Context`] forms a tree: cancelling a parent (or reaching its deadline)
//! terminates every child, while a child can be cancelled on its own without
//! touching the parent. Contexts are cheap to clone and can be moved into
//! spawned tasks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ConvoyError;

struct Inner {
    parent: Option<Context>,
    deadline: Option<Instant>,
    cancelled: watch::Sender<bool>,
}

/// Cancellable, optionally deadline-bearing execution context
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the context it was created with.
///
/// Dropping the handle does not cancel the context.
#[derive(Clone)]
pub struct CancelHandle {
    ctx: Context,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.ctx.inner.cancelled.send_replace(true);
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.ctx.is_done())
            .finish()
    }
}

impl Context {
    /// Root context, never cancelled and without deadline.
    pub fn background() -> Self {
        Self::new(None, None)
    }

    fn new(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                parent,
                deadline,
                cancelled,
            }),
        }
    }

    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let ctx = Self::new(Some(self.clone()), None);
        let handle = CancelHandle { ctx: ctx.clone() };
        (ctx, handle)
    }

    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        let ctx = Self::new(Some(self.clone()), Some(deadline));
        let handle = CancelHandle { ctx: ctx.clone() };
        (ctx, handle)
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Earliest deadline along the chain of ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        let mut deadline = None;
        let mut current = Some(self);
        while let Some(ctx) = current {
            deadline = earliest(deadline, ctx.inner.deadline);
            current = ctx.inner.parent.as_ref();
        }
        deadline
    }

    /// Reason the context is done, `None` while it is still active.
    pub fn err(&self) -> Option<ConvoyError> {
        let now = Instant::now();
        let mut current = Some(self);
        while let Some(ctx) = current {
            if *ctx.inner.cancelled.borrow() {
                return Some(ConvoyError::Cancelled);
            }
            if ctx.inner.deadline.is_some_and(|d| d <= now) {
                return Some(ConvoyError::DeadlineExceeded);
            }
            current = ctx.inner.parent.as_ref();
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline has passed.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let ctx = self.clone();
        async move { ctx.wait().await }
    }

    async fn wait(&self) {
        let mut waits: Vec<BoxFuture<'static, ()>> = Vec::new();
        let mut current = Some(self);
        while let Some(ctx) = current {
            let mut rx = ctx.inner.cancelled.subscribe();
            waits.push(
                async move {
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                }
                .boxed(),
            );
            current = ctx.inner.parent.as_ref();
        }
        if let Some(deadline) = self.deadline() {
            waits.push(tokio::time::sleep_until(deadline).boxed());
        }
        futures::future::select_all(waits).await;
    }

    /// Runs `fut` until it completes or the context is done.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ConvoyError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            _ = self.wait() => Err(self.err().unwrap_or(ConvoyError::Cancelled)),
            out = fut => Ok(out),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        let res = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let (parent, cancel_parent) = Context::background().with_cancel();
        let (child, cancel_child) = parent.with_cancel();

        cancel_child.cancel();
        assert_eq!(child.err(), Some(ConvoyError::Cancelled));
        assert!(parent.err().is_none());

        let (child2, _) = parent.with_cancel();
        cancel_parent.cancel();
        assert_eq!(child2.err(), Some(ConvoyError::Cancelled));
        child2.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(5));
        assert!(ctx.deadline().is_some());
        assert!(ctx.err().is_none());

        ctx.done().await;
        assert_eq!(ctx.err(), Some(ConvoyError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_inherits_earlier_deadline() {
        let (parent, _c1) = Context::background().with_timeout(Duration::from_secs(1));
        let (child, _c2) = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());

        child.done().await;
        assert_eq!(child.err(), Some(ConvoyError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_run_returns_output_or_cancelled() {
        let (ctx, cancel) = Context::background().with_cancel();
        assert_eq!(ctx.run(async { 42 }).await, Ok(42));

        cancel.cancel();
        let res = ctx.run(futures::future::pending::<()>()).await;
        assert_eq!(res, Err(ConvoyError::Cancelled));
    }
}
