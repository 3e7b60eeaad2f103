//! Lease-backed session that survives lease loss
//!
//! A session grants a lease, keeps it alive in the background and, when the
//! lease is lost (e.g. after a long store outage), grants a new one and runs
//! the registered `on_session` callbacks again, so lease-bound keys are
//! re-created.

use std::sync::Arc;
use std::time::Duration;

use convoy_common::{CancelHandle, Context, ConvoyError, RetryBackoff, Validation};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::KvStore;
use crate::error::{StoreError, StoreResult};
use crate::model::LeaseId;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lease time to live
    pub ttl: Duration,
    /// Timeout of one lease grant attempt
    pub grant_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            grant_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConvoyError> {
        let mut v = Validation::new();
        v.check(
            self.ttl >= Duration::from_secs(1),
            "session TTL must be at least 1s",
        );
        v.check(!self.grant_timeout.is_zero(), "grant timeout must be > 0");
        v.finish()
    }

    fn keep_alive_interval(&self) -> Duration {
        self.ttl / 3
    }
}

type OnSession = Box<dyn Fn(LeaseId) -> BoxFuture<'static, StoreResult<()>> + Send + Sync>;

/// Builds a [`Session`]
pub struct SessionBuilder {
    config: SessionConfig,
    callbacks: Vec<OnSession>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
        }
    }

    /// Callback invoked after each lease (re)creation.
    pub fn with_on_session<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(LeaseId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StoreResult<()>> + Send + 'static,
    {
        self.callbacks.push(Box::new(move |lease| f(lease).boxed()));
        self
    }

    /// Creates the first lease and starts the background keeper.
    ///
    /// Failure of the first lease or of its callbacks is returned, later
    /// failures are retried in the background.
    pub async fn start(self, ctx: &Context, store: Arc<dyn KvStore>) -> StoreResult<Session> {
        self.config
            .validate()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let (ctx, cancel) = ctx.with_cancel();
        let shared = Arc::new(Shared {
            config: self.config,
            callbacks: self.callbacks,
            store,
            lease: RwLock::new(None),
        });

        let lease = shared.create(&ctx).await?;
        *shared.lease.write() = Some(lease);

        let keeper = tokio::spawn(shared.clone().keep_alive_loop(ctx, lease));
        Ok(Session {
            shared,
            cancel,
            keeper: parking_lot::Mutex::new(Some(keeper)),
        })
    }
}

struct Shared {
    config: SessionConfig,
    callbacks: Vec<OnSession>,
    store: Arc<dyn KvStore>,
    lease: RwLock<Option<LeaseId>>,
}

impl Shared {
    async fn create(&self, ctx: &Context) -> StoreResult<LeaseId> {
        let (grant_ctx, _cancel) = ctx.with_timeout(self.config.grant_timeout);
        let lease = grant_ctx
            .run(self.store.grant_lease(self.config.ttl))
            .await??;

        for callback in &self.callbacks {
            if let Err(err) = ctx.run(callback(lease)).await.map_err(StoreError::from).and_then(|r| r) {
                let _ = self.store.revoke_lease(lease).await;
                return Err(err);
            }
        }
        debug!(lease, "session created");
        Ok(lease)
    }

    async fn keep_alive_loop(self: Arc<Self>, ctx: Context, mut lease: LeaseId) {
        let mut backoff = RetryBackoff::default();
        let interval = self.config.keep_alive_interval();

        loop {
            if ctx.run(tokio::time::sleep(interval)).await.is_err() {
                return;
            }
            match ctx.run(self.store.keep_alive(lease)).await {
                Err(_) => return,
                Ok(Ok(_)) => continue,
                Ok(Err(StoreError::LeaseNotFound(_))) => {
                    warn!(lease, "session lost, creating a new one");
                    *self.lease.write() = None;
                }
                Ok(Err(err)) => {
                    warn!(lease, "cannot renew session lease: {}", err);
                    continue;
                }
            }

            backoff.reset();
            loop {
                match self.create(&ctx).await {
                    Ok(new_lease) => {
                        info!(lease = new_lease, "session re-created");
                        lease = new_lease;
                        *self.lease.write() = Some(lease);
                        break;
                    }
                    Err(StoreError::Cancelled) => return,
                    Err(err) => {
                        let delay = backoff.next_backoff();
                        warn!("cannot create session, backoff delay {:?}: {}", delay, err);
                        if ctx.run(tokio::time::sleep(delay)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Active session, see [`SessionBuilder`]
pub struct Session {
    shared: Arc<Shared>,
    cancel: CancelHandle,
    keeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Lease of the current session, `NoSession` while it is being re-created.
    pub fn lease_id(&self) -> StoreResult<LeaseId> {
        (*self.shared.lease.read()).ok_or(StoreError::NoSession)
    }

    pub fn ttl(&self) -> Duration {
        self.shared.config.ttl
    }

    /// Stops the keeper and revokes the lease, deleting all keys bound to it.
    pub async fn close(&self) {
        self.cancel.cancel();
        let keeper = self.keeper.lock().take();
        if let Some(keeper) = keeper {
            let _ = keeper.await;
        }

        let lease = self.shared.lease.write().take();
        if let Some(lease) = lease {
            let revoke = self.shared.store.revoke_lease(lease);
            match tokio::time::timeout(self.shared.config.grant_timeout, revoke).await {
                Ok(Ok(())) => debug!(lease, "session closed"),
                Ok(Err(err)) => warn!(lease, "cannot revoke session lease: {}", err),
                Err(_) => warn!(lease, "cannot revoke session lease: timeout"),
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &*self.shared.lease.read())
            .field("ttl", &self.shared.config.ttl)
            .finish()
    }
}
