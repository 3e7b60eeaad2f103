//! Distribution Integration Tests
//!
//! Membership discovery and key ownership across nodes sharing one store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{GROUP, TestNode, distribution_config, eventually};
use convoy_common::{Context, Process};
use convoy_core::distribution::{ChangeEventType, DistributionNode};
use convoy_core::DistributionError;
use convoy_store::{
    GetPrefixResponse, KeyValue, KvStore, LeaseId, MemoryStore, Revision, StoreResult, Txn,
    TxnResponse, WatchStream,
};

/// Hides one node from prefix reads, as if its registration was lost
struct HidingStore {
    inner: Arc<MemoryStore>,
    hidden_suffix: String,
}

#[async_trait]
impl KvStore for HidingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<GetPrefixResponse> {
        let mut resp = self.inner.get_prefix(prefix).await?;
        resp.kvs.retain(|kv| !kv.key.ends_with(&self.hidden_suffix));
        Ok(resp)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        self.inner.txn(txn).await
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Duration> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.revoke_lease(lease).await
    }

    fn watch(&self, prefix: &str, from_revision: Revision) -> WatchStream {
        self.inner.watch(prefix, from_revision)
    }
}

async fn wait_for_nodes(node: &DistributionNode, expected: &[&str]) {
    eventually(|| async { node.nodes() == expected }).await;
}

// ============== Membership Tests ==============

#[tokio::test]
async fn test_nodes_discover_each_other() {
    let store = MemoryStore::new();
    let node1 = TestNode::start(&store, "node1").await;
    let node2 = TestNode::start(&store, "node2").await;

    let dist1 = node1.deps.distribution.clone();
    let dist2 = node2.deps.distribution.clone();
    wait_for_nodes(&dist1, &["node1", "node2"]).await;
    wait_for_nodes(&dist2, &["node1", "node2"]).await;

    // both nodes agree on every key
    for i in 1..=20 {
        let key = format!("receiver/{i}");
        let owner = dist1.node_for(&key).unwrap();
        assert_eq!(dist2.node_for(&key).unwrap(), owner);
        assert_ne!(dist1.is_owner(&key), dist2.is_owner(&key));
    }

    node2.shutdown().await;
    wait_for_nodes(&dist1, &["node1"]).await;
    assert!(dist1.is_owner("receiver/1"));
    assert!(
        store
            .get("runtime/distribution/group/workers/nodes/node2")
            .await
            .unwrap()
            .is_none()
    );

    node1.shutdown().await;
}

#[tokio::test]
async fn test_change_events() {
    let store = MemoryStore::new();
    let node1 = TestNode::start(&store, "node1").await;
    let mut listener = node1.deps.distribution.on_change_listener();

    let node2 = TestNode::start(&store, "node2").await;
    let events = listener.recv().await.unwrap();
    let events: Vec<_> = events.into_iter().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_type, ChangeEventType::Added);
    assert_eq!(events[0].node_id, "node2");
    assert_eq!(events[0].message, "found a new node \"node2\"");

    node2.shutdown().await;
    let events: Vec<_> = listener.recv().await.unwrap().into_iter().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change_type, ChangeEventType::Removed);
    assert_eq!(events[0].message, "the node \"node2\" gone");

    node1.shutdown().await;

    // listeners are closed on shutdown
    assert!(listener.recv().await.is_none());
}

#[tokio::test]
async fn test_node_id_registered_twice() {
    let store = MemoryStore::new();
    let node1 = TestNode::start(&store, "node1").await;
    let key = "runtime/distribution/group/workers/nodes/node1";
    let registered = store.get(key).await.unwrap().unwrap();

    let duplicate = Process::new("node1");
    let err = DistributionNode::start(
        &Context::background(),
        "node1",
        GROUP,
        store.clone(),
        duplicate.as_ref(),
        distribution_config(),
    )
    .await
    .unwrap_err();
    assert_eq!(err, DistributionError::AlreadyRegistered("node1".to_string()));
    assert_eq!(
        err.to_string(),
        "the node \"node1\" is already registered by another process"
    );

    // the first registration is untouched
    let kv = store.get(key).await.unwrap().unwrap();
    assert_eq!(kv.lease, registered.lease);
    assert_eq!(kv.mod_revision, registered.mod_revision);
    assert_eq!(node1.deps.distribution.nodes(), vec!["node1"]);

    // shutting down the failed duplicate does not unregister the first node
    duplicate.shutdown("test done").await;
    assert!(store.get(key).await.unwrap().is_some());

    node1.shutdown().await;
    assert!(store.get(key).await.unwrap().is_none());

    // the ID can be registered again once released
    let node1 = TestNode::start(&store, "node1").await;
    assert_eq!(node1.deps.distribution.nodes(), vec!["node1"]);
    node1.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_keeps_foreign_record() {
    let store = MemoryStore::new();
    let node1 = TestNode::start(&store, "node1").await;
    let key = "runtime/distribution/group/workers/nodes/node1";

    // the record is replaced under a lease of another process
    let foreign = store.grant_lease(Duration::from_secs(60)).await.unwrap();
    store.put(key, b"node1".to_vec(), Some(foreign)).await.unwrap();

    node1.shutdown().await;
    let kv = store.get(key).await.unwrap().unwrap();
    assert_eq!(kv.lease, foreign);
    store.revoke_lease(foreign).await.unwrap();
}

#[tokio::test]
async fn test_self_not_discovered() {
    let memory = MemoryStore::new();
    let store = Arc::new(HidingStore {
        inner: memory.clone(),
        hidden_suffix: "/nodes/node1".to_string(),
    });
    let process = Process::new("node1");

    let err = DistributionNode::start(
        &Context::background(),
        "node1",
        GROUP,
        store,
        process.as_ref(),
        distribution_config(),
    )
    .await
    .unwrap_err();
    assert_eq!(err, DistributionError::SelfNotDiscovered("node1".to_string()));

    // the failed node leaves nothing behind
    eventually(|| async {
        memory
            .get_prefix("runtime/distribution/")
            .await
            .map(|resp| resp.kvs.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert_eq!(memory.lease_count(), 0);
}

#[tokio::test]
async fn test_startup_fails_without_store() {
    let store = MemoryStore::new();
    store.set_available(false);
    let process = Process::new("node1");

    let config = convoy_core::DistributionConfig {
        startup_timeout: Duration::from_millis(200),
        ..distribution_config()
    };
    let result = DistributionNode::start(
        &Context::background(),
        "node1",
        GROUP,
        store.clone(),
        process.as_ref(),
        config,
    )
    .await;
    assert!(result.is_err());
}
