//! Convoy Store - Coordination store abstraction
//!
//! This crate provides:
//! - The `KvStore` contract: revisioned key-values, leases, transactions, prefix watches
//! - `MemoryStore`: strongly consistent in-process implementation
//! - `get_all_and_watch`: snapshot followed by an auto-restarting watch
//! - `Session`: lease kept alive in the background and re-created after expiry

pub mod error;
pub mod keys;
pub mod memory;
pub mod model;
pub mod session;
pub mod watch;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::{StoreError, StoreResult};
pub use keys::Prefix;
pub use memory::MemoryStore;
pub use model::{
    Compare, EventType, GetPrefixResponse, KeyValue, LeaseId, Revision, Txn, TxnOp, TxnResponse,
    WatchEvent, WatchResponse, encode_json,
};
pub use session::{Session, SessionBuilder, SessionConfig};
pub use watch::get_all_and_watch;

/// Stream of watch batches
pub type WatchStream = BoxStream<'static, StoreResult<WatchResponse>>;

/// Strongly consistent key-value store used for coordination
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// All keys under `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<GetPrefixResponse>;

    /// Puts the value, optionally bound to a lease; returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse>;

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Renews the lease, returns its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Duration>;

    /// Revokes the lease and deletes all keys attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    /// Watches keys under `prefix` starting at `from_revision`.
    ///
    /// `from_revision <= 0` watches from the next revision. Errors are
    /// delivered in the stream, which then ends.
    fn watch(&self, prefix: &str, from_revision: Revision) -> WatchStream;
}
