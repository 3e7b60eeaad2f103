//! Fan-out of change events to listeners
//!
//! Each listener has its own worker and unbounded pending queue, so a slow
//! listener never delays the others. Delivery to a listener waits until the
//! listener accepts the batch or the listener is stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use convoy_common::{CancelHandle, Context};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event::ChangeEvents;

struct Entry {
    pending: mpsc::UnboundedSender<ChangeEvents>,
    cancel: CancelHandle,
    worker: JoinHandle<()>,
}

struct Inner {
    node_id: String,
    next_id: AtomicU64,
    entries: DashMap<u64, Entry>,
    buffer: Mutex<ChangeEvents>,
    group_interval: Duration,
    /// Parent of all worker contexts, cancelled on forced shutdown.
    cancel_workers: CancelHandle,
    workers_ctx: Context,
    cancel_flusher: CancelHandle,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn flush(&self) {
        let events = std::mem::take(&mut *self.buffer.lock());
        if events.is_empty() {
            return;
        }
        debug!(node = %self.node_id, count = events.len(), "notifying {} listeners", self.entries.len());
        for entry in self.entries.iter() {
            let _ = entry.pending.send(events.clone());
        }
    }
}

/// Registry of change listeners with optional event coalescing
#[derive(Clone)]
pub struct Listeners {
    inner: Arc<Inner>,
}

impl Listeners {
    /// With a zero `group_interval` every batch is delivered immediately,
    /// otherwise batches are merged and delivered once per interval.
    pub fn new(node_id: impl Into<String>, group_interval: Duration) -> Self {
        let (workers_ctx, cancel_workers) = Context::background().with_cancel();
        let (flusher_ctx, cancel_flusher) = Context::background().with_cancel();
        let inner = Arc::new(Inner {
            node_id: node_id.into(),
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            buffer: Mutex::new(ChangeEvents::default()),
            group_interval,
            cancel_workers,
            workers_ctx,
            cancel_flusher,
            flusher: Mutex::new(None),
        });

        if !group_interval.is_zero() {
            let handle = tokio::spawn(run_flusher(Arc::downgrade(&inner), flusher_ctx, group_interval));
            *inner.flusher.lock() = Some(handle);
        }

        Self { inner }
    }

    /// Registers a new listener.
    ///
    /// Batches queue up without limit until the listener receives them, so a
    /// listener must be drained or dropped.
    pub fn subscribe(&self) -> Listener {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(1);
        let (ctx, cancel) = self.inner.workers_ctx.with_cancel();

        let worker = tokio::spawn(deliver(pending_rx, out_tx, ctx));
        self.inner.entries.insert(
            id,
            Entry {
                pending: pending_tx,
                cancel: cancel.clone(),
                worker,
            },
        );
        debug!(node = %self.inner.node_id, listener = id, "listener registered");

        Listener {
            id,
            rx: out_rx,
            cancel,
            owner: Arc::downgrade(&self.inner),
        }
    }

    pub fn notify(&self, events: ChangeEvents) {
        if events.is_empty() {
            return;
        }
        self.inner.buffer.lock().extend(events);
        if self.inner.group_interval.is_zero() {
            self.inner.flush();
        }
    }

    /// Delivers buffered events now.
    pub fn flush(&self) {
        self.inner.flush();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Flushes buffered events, lets the workers deliver what is pending and
    /// cancels the ones still busy after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.cancel_flusher.cancel();
        let flusher = self.inner.flusher.lock().take();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }
        self.inner.flush();

        let ids: Vec<u64> = self.inner.entries.iter().map(|e| *e.key()).collect();
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.inner.entries.remove(&id) {
                // closing the queue lets the worker exit once it is drained
                drop(entry.pending);
                workers.push(entry.worker);
            }
        }

        let count = workers.len();
        if tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!(node = %self.inner.node_id, "listeners did not finish within {:?}, cancelling", timeout);
        }
        self.inner.cancel_workers.cancel();
        info!(node = %self.inner.node_id, "stopped {} listeners", count);
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("node_id", &self.inner.node_id)
            .field("listeners", &self.inner.entries.len())
            .field("group_interval", &self.inner.group_interval)
            .finish()
    }
}

async fn run_flusher(inner: Weak<Inner>, ctx: Context, interval: Duration) {
    loop {
        if ctx.run(tokio::time::sleep(interval)).await.is_err() {
            return;
        }
        match inner.upgrade() {
            Some(inner) => inner.flush(),
            None => return,
        }
    }
}

async fn deliver(
    mut pending: mpsc::UnboundedReceiver<ChangeEvents>,
    out: mpsc::Sender<ChangeEvents>,
    ctx: Context,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = ctx.done() => return,
            batch = pending.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };
        tokio::select! {
            biased;
            _ = ctx.done() => return,
            res = out.send(batch) => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

/// Receiving side of one subscription.
///
/// Undelivered batches are kept in an unbounded queue; call [`recv`] in a
/// loop or drop the listener, which unsubscribes it.
///
/// [`recv`]: Listener::recv
pub struct Listener {
    id: u64,
    rx: mpsc::Receiver<ChangeEvents>,
    cancel: CancelHandle,
    owner: Weak<Inner>,
}

impl Listener {
    /// Next batch, `None` once the listener is stopped or the node shut down.
    pub async fn recv(&mut self) -> Option<ChangeEvents> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(owner) = self.owner.upgrade() {
            if let Some((_, entry)) = owner.entries.remove(&self.id) {
                entry.cancel.cancel();
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

/// Logs every received change batch
pub struct LoggingListener;

impl LoggingListener {
    pub fn spawn(node_id: impl Into<String>, mut listener: Listener) -> JoinHandle<()> {
        let node_id = node_id.into();
        tokio::spawn(async move {
            while let Some(events) = listener.recv().await {
                for event in events.iter() {
                    info!(node = %node_id, change = %event.change_type, "[DistributionEvent] {}", event.message);
                }
            }
        })
    }
}
