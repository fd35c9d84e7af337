//! Live subscription bridge.
//!
//! Turns server-pushed snapshots into local store writes plus an
//! invalidation on the collection's key. Snapshots are applied one at a time
//! in arrival order by a worker task; when several queue up only the newest
//! is applied, since each one is the full collection.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::MutationBus;
use crate::cache::{CacheKey, OfflineCache};
use crate::error::StoreError;
use crate::remote::{LiveSubscription, RemoteDocument, RemoteStore, SnapshotCallback};
use crate::store::Batch;

/// Destination of pushed snapshots.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
  /// Key the snapshots are stored under.
  fn key(&self) -> &CacheKey;

  async fn apply_snapshot(&self, docs: Vec<RemoteDocument>) -> Result<(), StoreError>;

  /// Publish the invalidation for an applied snapshot.
  fn invalidate(&self, bus: &MutationBus) {
    bus.publish(self.key());
  }
}

/// Stores pushed documents as they arrive, without decoding them.
pub struct DocumentSink {
  key: CacheKey,
  cache: OfflineCache,
}

impl DocumentSink {
  pub fn new(key: CacheKey, cache: OfflineCache) -> Self {
    Self { key, cache }
  }
}

#[async_trait]
impl SnapshotSink for DocumentSink {
  fn key(&self) -> &CacheKey {
    &self.key
  }

  async fn apply_snapshot(&self, docs: Vec<RemoteDocument>) -> Result<(), StoreError> {
    self.cache.commit_local(&self.key, &docs, Batch::new())?;
    Ok(())
  }
}

/// An attached live subscription. Dropping it stops the bridge.
pub struct LiveBridge {
  key: CacheKey,
  subscription: Option<LiveSubscription>,
  stop: Option<oneshot::Sender<()>>,
  worker: Option<JoinHandle<()>>,
}

impl LiveBridge {
  /// Subscribe to `path` and feed its snapshots to `sink`.
  ///
  /// Never fails: if the subscription cannot be established the bridge is
  /// returned disconnected and readers keep relying on cached reads.
  pub fn attach(
    remote: &dyn RemoteStore,
    path: &str,
    sink: Arc<dyn SnapshotSink>,
    bus: MutationBus,
  ) -> Self {
    let key = sink.key().clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<RemoteDocument>>();

    let callback_key = key.clone();
    let on_snapshot: SnapshotCallback = Box::new(move |docs| {
      if tx.send(docs).is_err() {
        trace!(key = %callback_key, "bridge stopped, dropping snapshot");
      }
    });

    let subscription = match remote.subscribe_live(path, on_snapshot) {
      Ok(subscription) => subscription,
      Err(err) => {
        warn!(key = %key, path, error = %err, "live subscription unavailable, relying on cached reads");
        return Self {
          key,
          subscription: None,
          stop: None,
          worker: None,
        };
      }
    };

    let (stop, mut stopped) = oneshot::channel::<()>();
    let worker_key = key.clone();
    let worker = tokio::spawn(async move {
      loop {
        tokio::select! {
          biased;
          received = rx.recv() => {
            let Some(mut docs) = received else { break };
            while let Ok(newer) = rx.try_recv() {
              docs = newer;
            }
            debug!(key = %worker_key, documents = docs.len(), "applying live snapshot");
            match sink.apply_snapshot(docs).await {
              Ok(()) => sink.invalidate(&bus),
              Err(err) => warn!(key = %worker_key, error = %err, "failed to store live snapshot"),
            }
          }
          _ = &mut stopped => break,
        }
      }
    });

    Self {
      key,
      subscription: Some(subscription),
      stop: Some(stop),
      worker: Some(worker),
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn is_connected(&self) -> bool {
    self.subscription.is_some()
  }

  /// Unsubscribe, apply snapshots already received, and wait for the worker
  /// to finish.
  pub async fn detach(mut self) {
    if let Some(subscription) = self.subscription.take() {
      subscription.unsubscribe();
    }
    drop(self.stop.take());
    if let Some(worker) = self.worker.take() {
      if let Err(err) = worker.await {
        warn!(key = %self.key, error = %err, "live bridge worker failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ManualClock;
  use crate::remote::MemoryRemote;
  use crate::store::{LocalStore, MemoryBackend};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn cache() -> OfflineCache {
    OfflineCache::new(
      LocalStore::new(Arc::new(MemoryBackend::new())),
      MutationBus::new(),
      Arc::new(ManualClock::default()),
    )
  }

  #[tokio::test]
  async fn test_snapshots_are_stored_and_published() {
    let cache = cache();
    let remote = MemoryRemote::new();
    let key = CacheKey::new("territories");
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let _sub = cache.bus().subscribe(&key, move |_| {
      seen.fetch_add(1, Ordering::SeqCst);
    });

    let bridge = LiveBridge::attach(
      &remote,
      "territories",
      Arc::new(DocumentSink::new(key.clone(), cache.clone())),
      cache.bus().clone(),
    );
    assert!(bridge.is_connected());
    remote.insert("territories", "t1", json!({"name": "North"}), None);
    bridge.detach().await;

    let stored = cache.peek::<Vec<RemoteDocument>>(&key).unwrap();
    assert_eq!(stored.data.len(), 1);
    assert_eq!(stored.data[0].id, "t1");
    assert!(hits.load(Ordering::SeqCst) >= 1);
    assert_eq!(remote.subscriber_count("territories"), 0);
  }

  #[tokio::test]
  async fn test_failed_subscription_leaves_bridge_disconnected() {
    let cache = cache();
    let remote = MemoryRemote::new();
    remote.set_online(false);
    let key = CacheKey::new("groups");

    let bridge = LiveBridge::attach(
      &remote,
      "groups",
      Arc::new(DocumentSink::new(key.clone(), cache.clone())),
      cache.bus().clone(),
    );

    assert!(!bridge.is_connected());
    bridge.detach().await;
    assert!(cache.peek::<Vec<RemoteDocument>>(&key).is_none());
  }
}
