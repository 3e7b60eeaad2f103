//! Store data model: key-values, transactions and watch events

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};

pub type Revision = i64;
pub type LeaseId = i64;

/// Stored key with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: i64,
    /// Attached lease, `0` when none.
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn value_str(&self) -> &str {
        std::str::from_utf8(&self.value).unwrap_or_default()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_slice(&self.value).map_err(|e| StoreError::Decode {
            key: self.key.clone(),
            message: e.to_string(),
        })
    }
}

/// Serializes `value` to JSON for storing under `key`.
pub fn encode_json<T: Serialize>(key: &str, value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Result of a prefix read
#[derive(Debug, Clone, Default)]
pub struct GetPrefixResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at the time of the read.
    pub revision: Revision,
}

/// Transaction guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    Exists(String),
    NotExists(String),
    ValueEquals(String, Vec<u8>),
    ModRevisionEquals(String, Revision),
    /// The key exists and is attached to the lease.
    LeaseEquals(String, LeaseId),
}

impl Compare {
    pub fn key(&self) -> &str {
        match self {
            Compare::Exists(k)
            | Compare::NotExists(k)
            | Compare::ValueEquals(k, _)
            | Compare::ModRevisionEquals(k, _)
            | Compare::LeaseEquals(k, _) => k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

/// Atomic compare-and-apply transaction.
///
/// All compares are evaluated against one store revision; when every compare
/// holds the `then` operations are applied, otherwise the `or_else` ones.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: Revision,
}

/// Watch event type; the order is used to sort events within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

/// One batch of watch events.
///
/// `snapshot` marks the initial "get all" batch of
/// [`get_all_and_watch`](crate::watch::get_all_and_watch), `restarted` marks a
/// snapshot emitted after the watcher had to be re-created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
    pub snapshot: bool,
    pub restarted: bool,
}

impl WatchResponse {
    pub fn sort_events(&mut self) {
        self.events
            .sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.kv.key.cmp(&b.kv.key)));
    }
}
