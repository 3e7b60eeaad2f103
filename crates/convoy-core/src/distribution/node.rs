//! Membership node of a distribution group
//!
//! The node registers itself under a lease-bound key, watches the other
//! members of the group and keeps an [`Assigner`] in sync with them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use convoy_common::{CancelHandle, Context, ConvoyError, ShutdownHook, ShutdownRegistrar, Validation};
use convoy_store::{
    Compare, EventType, KvStore, LeaseId, Prefix, Session, SessionBuilder, SessionConfig, StoreError, Txn,
    TxnOp, WatchResponse, WatchStream, get_all_and_watch,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::assigner::{Assigner, Ring};
use super::event::{ChangeEvent, ChangeEvents};
use super::listener::{Listener, Listeners};
use crate::error::DistributionError;
use crate::{keys, metrics};

/// Distribution node configuration
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// TTL of the membership lease
    pub ttl: Duration,
    /// Timeout of registration and initial discovery
    pub startup_timeout: Duration,
    /// Timeout of unregistration and listener draining
    pub shutdown_timeout: Duration,
    /// Change events are merged and delivered once per interval, zero disables it
    pub events_group_interval: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            events_group_interval: Duration::from_secs(5),
        }
    }
}

impl DistributionConfig {
    pub fn validate(&self) -> Result<(), ConvoyError> {
        let mut v = Validation::new();
        v.check(self.ttl >= Duration::from_secs(1), "TTL must be at least 1s")
            .check(!self.startup_timeout.is_zero(), "startup timeout must be > 0")
            .check(!self.shutdown_timeout.is_zero(), "shutdown timeout must be > 0");
        v.finish()
    }
}

/// Lifecycle of a distribution node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Joining,
    Registered,
    Watching,
    ShuttingDown,
    Unregistered,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Joining => write!(f, "JOINING"),
            NodeState::Registered => write!(f, "REGISTERED"),
            NodeState::Watching => write!(f, "WATCHING"),
            NodeState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            NodeState::Unregistered => write!(f, "UNREGISTERED"),
        }
    }
}

/// Member of one distribution group
pub struct DistributionNode {
    node_id: String,
    group: String,
    key: String,
    config: DistributionConfig,
    store: Arc<dyn KvStore>,
    assigner: Arc<Assigner>,
    listeners: Listeners,
    state: RwLock<NodeState>,
    session: Session,
    watch_cancel: CancelHandle,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DistributionNode {
    /// Registers the node, discovers the group and starts watching it.
    ///
    /// Returns once the node has seen itself in the group. Shutdown is
    /// registered to `registrar`.
    pub async fn start(
        ctx: &Context,
        node_id: impl Into<String>,
        group: impl Into<String>,
        store: Arc<dyn KvStore>,
        registrar: &dyn ShutdownRegistrar,
        config: DistributionConfig,
    ) -> Result<Arc<Self>, DistributionError> {
        config.validate()?;
        let node_id = node_id.into();
        let group = group.into();
        let deadline = Instant::now() + config.startup_timeout;
        let timeout = DistributionError::StartupTimeout(config.startup_timeout);

        info!(node = %node_id, group = %group, "node ID \"{}\"", node_id);

        let prefix = keys::distribution_nodes(&group);
        let key = prefix.key(&node_id);
        let assigner = Arc::new(Assigner::new(node_id.clone()));
        let listeners = Listeners::new(node_id.clone(), config.events_group_interval);

        // Join
        info!(node = %node_id, group = %group, "registering the node");
        let session_config = SessionConfig {
            ttl: config.ttl,
            ..Default::default()
        };
        let session = SessionBuilder::new(session_config).with_on_session({
            let store = store.clone();
            let key = key.clone();
            let node_id = node_id.clone();
            move |lease| register(store.clone(), key.clone(), node_id.clone(), lease)
        });
        let session = match tokio::time::timeout_at(deadline, session.start(ctx, store.clone())).await {
            Ok(Ok(session)) => session,
            Ok(Err(StoreError::AlreadyExists(_))) => {
                error!(node = %node_id, group = %group, "the node ID is already registered");
                return Err(DistributionError::AlreadyRegistered(node_id));
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(timeout),
        };
        info!(node = %node_id, group = %group, "registered");

        // Discover
        info!(node = %node_id, group = %group, "watching for other nodes");
        let (watch_ctx, watch_cancel) = ctx.with_cancel();
        let (init_tx, init_rx) = oneshot::channel();
        let stream = get_all_and_watch(store.clone(), prefix.as_str(), watch_ctx);
        let watcher = tokio::spawn(run_watcher(
            stream,
            Watched {
                node_id: node_id.clone(),
                group: group.clone(),
                prefix,
                assigner: assigner.clone(),
                listeners: listeners.clone(),
            },
            init_tx,
        ));

        let init = match tokio::time::timeout_at(deadline, init_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DistributionError::Store(StoreError::Closed)),
            Err(_) => Err(timeout),
        };
        if let Err(err) = init {
            error!(node = %node_id, group = %group, "cannot start distribution node: {}", err);
            watch_cancel.cancel();
            let _ = watcher.await;
            // revoking the lease removes the membership key
            session.close().await;
            listeners.shutdown(config.shutdown_timeout).await;
            return Err(err);
        }

        let node = Arc::new(Self {
            node_id,
            group,
            key,
            config,
            store,
            assigner,
            listeners,
            state: RwLock::new(NodeState::Watching),
            session,
            watch_cancel,
            watcher: Mutex::new(Some(watcher)),
        });

        let hook_node = node.clone();
        registrar.on_shutdown(ShutdownHook::new(move || async move {
            hook_node.shutdown().await;
        }));

        Ok(node)
    }

    async fn shutdown(&self) {
        info!(node = %self.node_id, group = %self.group, "received shutdown request");
        *self.state.write() = NodeState::ShuttingDown;

        // Stop accepting watch events
        self.watch_cancel.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        info!(node = %self.node_id, group = %self.group, "unregistering the node");
        match tokio::time::timeout(self.config.shutdown_timeout, self.unregister()).await {
            Ok(Ok(true)) => info!(node = %self.node_id, group = %self.group, "unregistered"),
            Ok(Ok(false)) => {
                warn!(node = %self.node_id, group = %self.group, "cannot unregister the node: not registered")
            }
            Ok(Err(err)) => warn!(node = %self.node_id, group = %self.group, "cannot unregister the node: {}", err),
            Err(_) => warn!(node = %self.node_id, group = %self.group, "cannot unregister the node: timeout"),
        }

        self.session.close().await;
        self.listeners.shutdown(self.config.shutdown_timeout).await;

        *self.state.write() = NodeState::Unregistered;
        info!(node = %self.node_id, group = %self.group, "shutdown done");
    }

    /// Deletes the membership record if it is still bound to this node's lease.
    async fn unregister(&self) -> Result<bool, StoreError> {
        let lease = self.session.lease_id()?;
        let txn = Txn::new()
            .when(Compare::LeaseEquals(self.key.clone(), lease))
            .then(TxnOp::delete(self.key.clone()));
        Ok(self.store.txn(txn).await?.succeeded)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Sorted IDs of all known nodes, including this one.
    pub fn nodes(&self) -> Vec<String> {
        self.assigner.nodes()
    }

    pub fn node_for(&self, key: &str) -> Result<String, DistributionError> {
        self.assigner.node_for(key)
    }

    pub fn is_owner(&self, key: &str) -> bool {
        self.assigner.is_owner(key)
    }

    pub fn assigner(&self) -> Arc<Assigner> {
        self.assigner.clone()
    }

    /// Subscribes to membership changes.
    pub fn on_change_listener(&self) -> Listener {
        self.listeners.subscribe()
    }
}

impl std::fmt::Debug for DistributionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionNode")
            .field("node_id", &self.node_id)
            .field("group", &self.group)
            .field("state", &self.state())
            .field("nodes", &self.nodes())
            .finish()
    }
}

/// Puts the membership record bound to `lease`, unless another process
/// already holds the node ID.
async fn register(
    store: Arc<dyn KvStore>,
    key: String,
    node_id: String,
    lease: LeaseId,
) -> Result<(), StoreError> {
    let txn = Txn::new()
        .when(Compare::NotExists(key.clone()))
        .then(TxnOp::put_with_lease(key.clone(), node_id.into_bytes(), lease));
    if store.txn(txn).await?.succeeded {
        Ok(())
    } else {
        Err(StoreError::AlreadyExists(key))
    }
}

struct Watched {
    node_id: String,
    group: String,
    prefix: Prefix,
    assigner: Arc<Assigner>,
    listeners: Listeners,
}

async fn run_watcher(
    mut stream: WatchStream,
    watched: Watched,
    init: oneshot::Sender<Result<(), DistributionError>>,
) {
    let mut init = Some(init);
    while let Some(item) = stream.next().await {
        let resp = match item {
            Ok(resp) => resp,
            Err(err) => {
                match init.take() {
                    Some(init) => {
                        let _ = init.send(Err(err.into()));
                    }
                    None => error!(node = %watched.node_id, group = %watched.group, "watch failed: {}", err),
                }
                return;
            }
        };

        let events = watched
            .assigner
            .update(|ring| apply_watch_response(ring, &watched.prefix, &resp));
        for event in events.iter() {
            info!(node = %watched.node_id, group = %watched.group, "{}", event.message);
        }
        metrics::set_distribution_nodes(&watched.group, watched.assigner.nodes().len());

        if let Some(init) = init.take() {
            if !watched.assigner.has_node(&watched.node_id) {
                let _ = init.send(Err(DistributionError::SelfNotDiscovered(
                    watched.node_id.clone(),
                )));
                return;
            }
            let _ = init.send(Ok(()));
        }

        watched.listeners.notify(events);
    }
}

/// Applies one watch batch to the ring and returns the resulting changes.
///
/// A snapshot replaces the ring content, other batches are merged: adding a
/// known node or removing an unknown one is ignored and produces no event.
pub(crate) fn apply_watch_response(ring: &mut Ring, prefix: &Prefix, resp: &WatchResponse) -> ChangeEvents {
    let mut events = ChangeEvents::default();

    if resp.snapshot {
        let discovered: BTreeSet<&str> = resp
            .events
            .iter()
            .filter_map(|e| prefix.strip(&e.kv.key))
            .collect();
        let known: Vec<String> = ring.nodes().map(str::to_string).collect();
        for node in &known {
            if !discovered.contains(node.as_str()) {
                events.push(ChangeEvent::node_removed(node));
            }
        }
        for node in &discovered {
            if !ring.contains(node) {
                events.push(ChangeEvent::node_added(*node));
            }
        }
        ring.clear();
        for node in discovered {
            ring.add_node(node);
        }
        return events;
    }

    for event in &resp.events {
        let Some(node) = prefix.strip(&event.kv.key) else {
            continue;
        };
        match event.kind {
            EventType::Create | EventType::Update => {
                if ring.add_node(node) {
                    events.push(ChangeEvent::node_added(node));
                }
            }
            EventType::Delete => {
                if ring.remove_node(node) {
                    events.push(ChangeEvent::node_removed(node));
                }
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::event::ChangeEventType;
    use convoy_store::{KeyValue, WatchEvent};

    fn event(kind: EventType, key: &str) -> WatchEvent {
        WatchEvent {
            kind,
            kv: KeyValue {
                key: key.to_string(),
                ..Default::default()
            },
            prev_kv: None,
        }
    }

    fn response(snapshot: bool, events: Vec<WatchEvent>) -> WatchResponse {
        WatchResponse {
            events,
            snapshot,
            ..Default::default()
        }
    }

    fn changes(events: &ChangeEvents) -> Vec<(ChangeEventType, String)> {
        events.iter().map(|e| (e.change_type, e.node_id.clone())).collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(DistributionConfig::default().validate().is_ok());
        let config = DistributionConfig {
            ttl: Duration::ZERO,
            startup_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("TTL must be at least 1s"));
        assert!(err.contains("startup timeout must be > 0"));
    }

    #[test]
    fn test_snapshot_resets_ring() {
        let prefix = keys::distribution_nodes("g");
        let mut ring = Ring::new();
        ring.add_node("old");
        ring.add_node("node1");

        let events = apply_watch_response(
            &mut ring,
            &prefix,
            &response(
                true,
                vec![
                    event(EventType::Create, &prefix.key("node1")),
                    event(EventType::Create, &prefix.key("node2")),
                ],
            ),
        );
        assert_eq!(
            changes(&events),
            vec![
                (ChangeEventType::Removed, "old".to_string()),
                (ChangeEventType::Added, "node2".to_string()),
            ]
        );
        assert_eq!(ring.nodes().collect::<Vec<_>>(), vec!["node1", "node2"]);
    }

    #[test]
    fn test_duplicate_diffs_are_ignored() {
        let prefix = keys::distribution_nodes("g");
        let mut ring = Ring::new();
        ring.add_node("node1");

        let events = apply_watch_response(
            &mut ring,
            &prefix,
            &response(
                false,
                vec![
                    event(EventType::Create, &prefix.key("node1")),
                    event(EventType::Delete, &prefix.key("unknown")),
                    event(EventType::Create, &prefix.key("node2")),
                    event(EventType::Create, &prefix.key("node2")),
                ],
            ),
        );
        assert_eq!(changes(&events), vec![(ChangeEventType::Added, "node2".to_string())]);
        assert_eq!(ring.len(), 2);

        let events = apply_watch_response(
            &mut ring,
            &prefix,
            &response(false, vec![event(EventType::Delete, &prefix.key("node1"))]),
        );
        assert_eq!(changes(&events), vec![(ChangeEventType::Removed, "node1".to_string())]);
        assert_eq!(ring.nodes().collect::<Vec<_>>(), vec!["node2"]);
    }
}
