//! In-process strongly consistent store
//!
//! Every mutation is applied under one mutex and produces exactly one revision,
//! so reads, transactions and watches observe a single linear history. Leases
//! expire lazily on each operation and in a background reaper task.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Compare, EventType, GetPrefixResponse, KeyValue, LeaseId, Revision, Txn, TxnOp, TxnResponse,
    WatchEvent, WatchResponse,
};
use crate::{KvStore, WatchStream};

/// Number of revisions kept for watch replay
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

const REAPER_INTERVAL: Duration = Duration::from_millis(50);

type WatchSender = mpsc::UnboundedSender<StoreResult<WatchResponse>>;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: WatchSender,
}

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, KeyValue>,
    revision: Revision,
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    history: VecDeque<(Revision, Vec<WatchEvent>)>,
    /// Highest revision no longer available for replay.
    compacted: Revision,
    watchers: Vec<Watcher>,
}

fn matching(events: &[WatchEvent], prefix: &str) -> Vec<WatchEvent> {
    events
        .iter()
        .filter(|e| e.kv.key.starts_with(prefix))
        .cloned()
        .collect()
}

impl State {
    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Exists(key) => self.kvs.contains_key(key),
            Compare::NotExists(key) => !self.kvs.contains_key(key),
            Compare::ValueEquals(key, value) => self.kvs.get(key).is_some_and(|kv| &kv.value == value),
            Compare::ModRevisionEquals(key, rev) => {
                self.kvs.get(key).map_or(0, |kv| kv.mod_revision) == *rev
            }
            Compare::LeaseEquals(key, lease) => self.kvs.get(key).is_some_and(|kv| kv.lease == *lease),
        }
    }

    fn check_leases(&self, ops: &[TxnOp]) -> StoreResult<()> {
        for op in ops {
            if let TxnOp::Put { lease: Some(id), .. } = op {
                if *id != 0 && !self.leases.contains_key(id) {
                    return Err(StoreError::LeaseNotFound(*id));
                }
            }
        }
        Ok(())
    }

    fn detach(&mut self, key: &str, lease: LeaseId) {
        if lease != 0 {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.remove(key);
            }
        }
    }

    fn apply(&mut self, rev: Revision, op: &TxnOp) -> Option<WatchEvent> {
        match op {
            TxnOp::Put { key, value, lease } => {
                let lease = lease.unwrap_or(0);
                let prev = self.kvs.get(key).cloned();
                if let Some(prev) = &prev {
                    if prev.lease != lease {
                        self.detach(key, prev.lease);
                    }
                }
                if let Some(l) = self.leases.get_mut(&lease) {
                    l.keys.insert(key.clone());
                }
                let kv = KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                    create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
                    mod_revision: rev,
                    version: prev.as_ref().map_or(1, |p| p.version + 1),
                    lease,
                };
                self.kvs.insert(key.clone(), kv.clone());
                let kind = if prev.is_some() {
                    EventType::Update
                } else {
                    EventType::Create
                };
                Some(WatchEvent {
                    kind,
                    kv,
                    prev_kv: prev,
                })
            }
            TxnOp::Delete { key } => {
                let prev = self.kvs.remove(key)?;
                self.detach(key, prev.lease);
                Some(WatchEvent {
                    kind: EventType::Delete,
                    kv: KeyValue {
                        key: key.clone(),
                        mod_revision: rev,
                        ..Default::default()
                    },
                    prev_kv: Some(prev),
                })
            }
        }
    }

    /// Applies `ops` as one revision; no-op operations do not bump it.
    fn commit(&mut self, ops: &[TxnOp], history_limit: usize) -> Revision {
        let rev = self.revision + 1;
        let events: Vec<WatchEvent> = ops.iter().filter_map(|op| self.apply(rev, op)).collect();
        if events.is_empty() {
            return self.revision;
        }
        self.revision = rev;
        self.notify(rev, &events);
        self.history.push_back((rev, events));
        while self.history.len() > history_limit {
            if let Some((dropped, _)) = self.history.pop_front() {
                self.compacted = dropped;
            }
        }
        rev
    }

    fn notify(&mut self, rev: Revision, events: &[WatchEvent]) {
        self.watchers.retain(|w| {
            let matched = matching(events, &w.prefix);
            if matched.is_empty() {
                return !w.tx.is_closed();
            }
            w.tx
                .send(Ok(WatchResponse {
                    revision: rev,
                    events: matched,
                    ..Default::default()
                }))
                .is_ok()
        });
    }

    fn revoke(&mut self, id: LeaseId, history_limit: usize) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let ops: Vec<TxnOp> = lease.keys.into_iter().map(TxnOp::delete).collect();
        self.commit(&ops, history_limit);
        true
    }

    fn expire_leases(&mut self, now: Instant, history_limit: usize) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "lease expired");
            self.revoke(id, history_limit);
        }
    }

    fn fail_watchers(&mut self, err: StoreError) {
        for w in self.watchers.drain(..) {
            let _ = w.tx.send(Err(err.clone()));
        }
    }
}

/// In-memory implementation of [`KvStore`]
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
    closed: AtomicBool,
    history_limit: usize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Store keeping only the last `history_limit` revisions for watch replay.
    pub fn with_history_limit(history_limit: usize) -> Arc<Self> {
        let store = Arc::new(Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            history_limit: history_limit.max(1),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_leases(Arc::downgrade(&store)));
        }
        store
    }

    /// Simulates an outage: operations fail with `Unavailable` and all
    /// active watches are terminated.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.state.lock().fail_watchers(StoreError::Unavailable);
        }
        info!(available, "memory store availability changed");
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.lock().fail_watchers(StoreError::Closed);
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut state = self.state.lock();
        state.expire_leases(Instant::now(), self.history_limit);
        Ok(state)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("revision", &state.revision)
            .field("keys", &state.kvs.len())
            .field("leases", &state.leases.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

async fn reap_leases(store: Weak<MemoryStore>) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            break;
        };
        if store.closed.load(Ordering::SeqCst) {
            break;
        }
        store
            .state
            .lock()
            .expire_leases(Instant::now(), store.history_limit);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        Ok(self.state()?.kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<GetPrefixResponse> {
        let state = self.state()?;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(GetPrefixResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision> {
        let mut state = self.state()?;
        let ops = [TxnOp::Put {
            key: key.to_string(),
            value,
            lease,
        }];
        state.check_leases(&ops)?;
        Ok(state.commit(&ops, self.history_limit))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state()?;
        if !state.kvs.contains_key(key) {
            return Ok(false);
        }
        state.commit(&[TxnOp::delete(key)], self.history_limit);
        Ok(true)
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        let mut state = self.state()?;
        let succeeded = txn.compares.iter().all(|c| state.holds(c));
        let ops = if succeeded { &txn.success } else { &txn.failure };
        state.check_leases(ops)?;
        let revision = state.commit(ops, self.history_limit);
        Ok(TxnResponse {
            succeeded,
            revision,
        })
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        if ttl.is_zero() {
            return Err(StoreError::Internal("lease TTL must be > 0".to_string()));
        }
        let mut state = self.state()?;
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<Duration> {
        let mut state = self.state()?;
        let l = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        l.deadline = Instant::now() + l.ttl;
        Ok(l.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.revoke(lease, self.history_limit) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    fn watch(&self, prefix: &str, from_revision: Revision) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.state() {
            Err(err) => {
                let _ = tx.send(Err(err));
            }
            Ok(mut state) => {
                let from = if from_revision <= 0 {
                    state.revision + 1
                } else {
                    from_revision
                };
                if from <= state.compacted {
                    let _ = tx.send(Err(StoreError::Compacted {
                        requested: from,
                        compacted: state.compacted,
                    }));
                } else {
                    for (rev, events) in state.history.iter().filter(|(rev, _)| *rev >= from) {
                        let matched = matching(events, prefix);
                        if !matched.is_empty() {
                            let _ = tx.send(Ok(WatchResponse {
                                revision: *rev,
                                events: matched,
                                ..Default::default()
                            }));
                        }
                    }
                    state.watchers.push(Watcher {
                        prefix: prefix.to_string(),
                        tx,
                    });
                }
            }
        }
        UnboundedReceiverStream::new(rx).boxed()
    }
}
