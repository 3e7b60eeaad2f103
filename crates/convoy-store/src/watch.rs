//! "Get all, then watch" over a key prefix

use std::sync::Arc;

use convoy_common::{Context, RetryBackoff};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::model::{EventType, WatchEvent, WatchResponse};
use crate::{KvStore, WatchStream};

/// Reads all keys under `prefix` and then watches for changes.
///
/// The first item is a snapshot batch (`snapshot == true`) holding a create
/// event per existing key. Further items are incremental batches watched from
/// the snapshot revision + 1. If the underlying watch fails later, the watcher
/// is re-created with backoff and a new snapshot with `restarted == true` is
/// emitted, so consumers can reset their state. An error before the first
/// snapshot is delivered as the only item.
///
/// The stream ends when `ctx` is done or the stream is dropped.
pub fn get_all_and_watch(
    store: Arc<dyn KvStore>,
    prefix: impl Into<String>,
    ctx: Context,
) -> WatchStream {
    let prefix = prefix.into();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_watcher(store, prefix, ctx, tx));
    UnboundedReceiverStream::new(rx).boxed()
}

async fn run_watcher(
    store: Arc<dyn KvStore>,
    prefix: String,
    ctx: Context,
    tx: mpsc::UnboundedSender<StoreResult<WatchResponse>>,
) {
    let mut backoff = RetryBackoff::default();
    let mut initialized = false;

    loop {
        let snapshot = match ctx.run(store.get_prefix(&prefix)).await {
            Err(_) => return,
            Ok(Err(err)) if !initialized => {
                let _ = tx.send(Err(err));
                return;
            }
            Ok(Err(err)) => {
                let delay = backoff.next_backoff();
                warn!(prefix = %prefix, "re-creating watcher, backoff delay {:?}, reason: {}", delay, err);
                if ctx.run(tokio::time::sleep(delay)).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(Ok(resp)) => resp,
        };

        let mut batch = WatchResponse {
            revision: snapshot.revision,
            events: snapshot
                .kvs
                .into_iter()
                .map(|kv| WatchEvent {
                    kind: EventType::Create,
                    kv,
                    prev_kv: None,
                })
                .collect(),
            snapshot: true,
            restarted: initialized,
        };
        batch.sort_events();
        debug!(prefix = %prefix, revision = batch.revision, count = batch.events.len(), "snapshot loaded");
        if tx.send(Ok(batch)).is_err() {
            return;
        }
        initialized = true;

        let mut stream = store.watch(&prefix, snapshot.revision + 1);
        let reason = loop {
            tokio::select! {
                biased;
                _ = ctx.done() => return,
                _ = tx.closed() => return,
                next = stream.next() => match next {
                    Some(Ok(mut resp)) => {
                        backoff.reset();
                        resp.sort_events();
                        if tx.send(Ok(resp)).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => break err.to_string(),
                    None => break "watch stream closed".to_string(),
                },
            }
        };

        let delay = backoff.next_backoff();
        warn!(prefix = %prefix, "re-creating watcher, backoff delay {:?}, reason: {}", delay, reason);
        if ctx.run(tokio::time::sleep(delay)).await.is_err() {
            return;
        }
    }
}
