//! Local-first sync service, instantiated once per entity collection.

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{CreatePolicy, EntityConfig};
use super::lifecycle::SyncLifecycle;
use super::locks::KeyedLocks;
use super::reconcile::reconcile;
use super::record::{Outbox, Record};
use crate::bus::MutationBus;
use crate::cache::{CacheKey, Cacheable, OfflineCache, Resolved};
use crate::error::{CacheError, FetchError, RemoteError, StoreError, WriteError};
use crate::live::{LiveBridge, SnapshotSink};
use crate::remote::{RemoteDocument, RemoteStore};
use crate::store::Batch;

/// What happened to one pending write during a push.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PushOutcome {
  /// Update accepted by the remote store
  Updated,
  /// Provisional record created under the given authoritative id
  Created(String),
  /// Tombstone confirmed
  Deleted,
  /// The remote store no longer has the record; the local copy was dropped
  Gone,
  /// Remote write failed; retried on the next pass
  Deferred,
  /// Nothing left to push
  Skipped,
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub pushed: usize,
  pub created: usize,
  pub deleted: usize,
  pub dropped: usize,
  pub deferred: usize,
}

/// Outcome of [`EntitySyncService::sync_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult<T> {
  /// The remote store answered; `records` is the reconciled collection.
  Remote {
    records: Vec<Record<T>>,
    report: SyncReport,
  },
  /// The remote store could not be read; `records` is the local snapshot.
  Local { records: Vec<Record<T>> },
}

impl<T> SyncResult<T> {
  pub fn records(&self) -> &[Record<T>] {
    match self {
      SyncResult::Remote { records, .. } | SyncResult::Local { records } => records,
    }
  }

  pub fn into_records(self) -> Vec<Record<T>> {
    match self {
      SyncResult::Remote { records, .. } | SyncResult::Local { records } => records,
    }
  }

  pub fn is_authoritative(&self) -> bool {
    matches!(self, SyncResult::Remote { .. })
  }
}

/// Local-first create/update/delete and reconciliation for one collection.
///
/// Writes land in the local snapshot and its outbox atomically, publish an
/// invalidation, and reach the remote store in the background or on the next
/// [`sync_all`](Self::sync_all). Every read-modify-write of the snapshot holds
/// the collection lock; remote writes for one record hold that record's lock.
pub struct EntitySyncService<T> {
  config: EntityConfig,
  remote: Arc<dyn RemoteStore>,
  cache: OfflineCache,
  locks: Arc<KeyedLocks>,
  lifecycle: Arc<SyncLifecycle>,
  background: Arc<Mutex<Vec<JoinHandle<()>>>>,
  _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for EntitySyncService<T> {
  fn clone(&self) -> Self {
    Self {
      config: self.config.clone(),
      remote: Arc::clone(&self.remote),
      cache: self.cache.clone(),
      locks: Arc::clone(&self.locks),
      lifecycle: Arc::clone(&self.lifecycle),
      background: Arc::clone(&self.background),
      _entity: PhantomData,
    }
  }
}

impl<T: Cacheable> EntitySyncService<T> {
  pub fn new(
    config: EntityConfig,
    remote: Arc<dyn RemoteStore>,
    cache: OfflineCache,
    locks: Arc<KeyedLocks>,
    lifecycle: Arc<SyncLifecycle>,
  ) -> Self {
    Self {
      config,
      remote,
      cache,
      locks,
      lifecycle,
      background: Arc::new(Mutex::new(Vec::new())),
      _entity: PhantomData,
    }
  }

  pub fn config(&self) -> &EntityConfig {
    &self.config
  }

  pub fn key(&self) -> &CacheKey {
    &self.config.key
  }

  // ===== Reads =====

  /// Current local snapshot, pending writes included. Never touches the
  /// network.
  pub fn local(&self) -> Vec<Record<T>> {
    self.load().0
  }

  /// Read the collection through the offline cache with the entity's TTL.
  pub async fn resolve(&self) -> Result<Resolved<Vec<Record<T>>>, CacheError> {
    self.resolve_within(self.config.ttl).await
  }

  /// Read the collection through the offline cache, falling back to a cached
  /// copy no older than `ttl`. Pending local writes are always reflected.
  pub async fn resolve_within(
    &self,
    ttl: Duration,
  ) -> Result<Resolved<Vec<Record<T>>>, CacheError> {
    let mut resolved = self
      .cache
      .resolve(&self.config.key, || self.fetch_merged(), ttl)
      .await?;
    let outbox = self.outbox();
    resolved.data = overlay(resolved.data, &outbox);
    Ok(resolved)
  }

  // ===== Writes =====

  /// Add a record to the collection.
  ///
  /// While the remote store is reachable the record is created there first
  /// and keeps the authoritative id. Otherwise it gets a provisional id and
  /// is created by the next [`sync_all`](Self::sync_all), unless the entity
  /// requires remote confirmation.
  pub async fn create(&self, data: T) -> Result<Record<T>, WriteError> {
    let now = self.cache.now();
    let draft = Record::provisional(data, now);

    let record = if self.remote.is_reachable().await {
      let write = draft.to_write().map_err(|e| WriteError::InvalidRecord {
        entity: self.config.name.clone(),
        message: e.to_string(),
      })?;
      match self.remote.create_record(&self.config.path, write).await {
        Ok(id) => Record::confirmed(id, draft.data, now),
        Err(err) if self.config.create_policy == CreatePolicy::RequireRemote => {
          return Err(err.into());
        }
        Err(err) => {
          warn!(entity = %self.config.name, error = %err, "remote create failed, keeping record locally");
          draft
        }
      }
    } else if self.config.create_policy == CreatePolicy::RequireRemote {
      return Err(WriteError::Offline {
        entity: self.config.name.clone(),
      });
    } else {
      debug!(entity = %self.config.name, id = %draft.id, "remote unreachable, created provisional record");
      draft
    };

    {
      let _guard = self.lock_collection().await;
      let (mut records, outbox) = self.load();
      // A live snapshot may have delivered the new document already
      match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
      }
      self.persist(&records, &outbox.deletes)?;
    }
    self.publish();
    Ok(record)
  }

  /// Merge `patch` into record `id` and push it in the background.
  pub async fn update(&self, id: &str, patch: Value) -> Result<Record<T>, WriteError> {
    let mut updated = self.update_many(vec![(id.to_string(), patch)]).await?;
    updated.pop().ok_or_else(|| self.not_found(id))
  }

  /// Apply several patches in order as one local write.
  ///
  /// Either every patch applies or none does. One invalidation is published
  /// for the whole batch.
  pub async fn update_many(
    &self,
    patches: Vec<(String, Value)>,
  ) -> Result<Vec<Record<T>>, WriteError> {
    if patches.is_empty() {
      return Ok(Vec::new());
    }

    let updated = {
      let _guard = self.lock_collection().await;
      let (mut records, outbox) = self.load();
      let now = self.cache.now();
      let mut updated = Vec::with_capacity(patches.len());
      for (id, patch) in &patches {
        let record = records
          .iter_mut()
          .find(|r| &r.id == id)
          .ok_or_else(|| self.not_found(id))?;
        record
          .apply_patch(patch, now)
          .map_err(|message| WriteError::InvalidPatch {
            entity: self.config.name.clone(),
            id: id.clone(),
            message,
          })?;
        updated.push(record.clone());
      }
      self.persist(&records, &outbox.deletes)?;
      updated
    };
    self.publish();

    // Provisional records are created by the next sync pass
    let mut seen = HashSet::new();
    for record in updated.iter().filter(|r| !r.is_provisional()) {
      if seen.insert(record.id.clone()) {
        self.spawn_push(record.id.clone());
      }
    }
    Ok(updated)
  }

  /// Remove record `id` locally and delete it remotely in the background.
  pub async fn delete(&self, id: &str) -> Result<(), WriteError> {
    let tombstoned = {
      let _guard = self.lock_collection().await;
      let (mut records, mut outbox) = self.load();
      let index = records
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(|| self.not_found(id))?;
      let removed = records.remove(index);
      let tombstone = !removed.is_provisional();
      if tombstone && !outbox.deletes.contains(&removed.id) {
        outbox.deletes.push(removed.id);
      }
      self.persist(&records, &outbox.deletes)?;
      tombstone
    };
    self.publish();

    if tombstoned {
      self.spawn_delete(id.to_string());
    }
    Ok(())
  }

  // ===== Reconciliation =====

  /// Push pending writes, then replace the snapshot with the remote
  /// collection while keeping local edits the remote has not caught up with.
  ///
  /// Unreachable remote: returns the local snapshot and writes nothing.
  /// Publishes at most one invalidation.
  pub async fn sync_all(&self) -> Result<SyncResult<T>, StoreError> {
    if !self.remote.is_reachable().await {
      debug!(entity = %self.config.name, "remote unreachable, returning local snapshot");
      return Ok(SyncResult::Local {
        records: self.local(),
      });
    }

    let mut report = SyncReport::default();
    let pending: Vec<String> = self
      .local()
      .into_iter()
      .filter(|r| !r.synced)
      .map(|r| r.id)
      .collect();
    for id in pending {
      let outcome = self.push_one(&id).await?;
      report.count(&outcome);
    }

    // Deletes go last so creates orphaned by a concurrent delete are cleaned
    // up in the same pass
    for id in self.outbox().deletes {
      let outcome = self.push_delete(&id).await?;
      report.count(&outcome);
    }

    let docs = match self.remote.fetch_collection(&self.config.path).await {
      Ok(docs) => docs,
      Err(err) => {
        warn!(entity = %self.config.name, error = %err, "fetch failed during sync, keeping local snapshot");
        if report.changed() {
          self.publish();
        }
        return Ok(SyncResult::Local {
          records: self.local(),
        });
      }
    };
    let remote = self.decode(docs);

    let records = {
      let _guard = self.lock_collection().await;
      let (local, outbox) = self.load();
      let merged = reconcile(&local, remote, &outbox.deletes);
      self.persist(&merged, &outbox.deletes)?;
      merged
    };
    self.lifecycle.mark_synced(&self.config.key);
    self.publish();

    info!(
      entity = %self.config.name,
      records = records.len(),
      pushed = report.pushed,
      created = report.created,
      deleted = report.deleted,
      dropped = report.dropped,
      deferred = report.deferred,
      "sync complete"
    );
    Ok(SyncResult::Remote { records, report })
  }

  /// Run [`sync_all`](Self::sync_all) unless this collection already
  /// completed a reachable sync in the current session.
  pub async fn ensure_synced(&self) -> Result<Option<SyncResult<T>>, StoreError> {
    if self.lifecycle.has_synced(&self.config.key) {
      return Ok(None);
    }
    self.sync_all().await.map(Some)
  }

  /// Wait for every background remote write started so far.
  pub async fn flush(&self) {
    loop {
      let handles = std::mem::take(&mut *self.background());
      if handles.is_empty() {
        return;
      }
      for result in futures::future::join_all(handles).await {
        if let Err(err) = result {
          warn!(entity = %self.config.name, error = %err, "background sync task failed");
        }
      }
    }
  }

  /// Mirror the remote collection's live snapshots into the local store.
  pub fn watch(&self) -> LiveBridge {
    LiveBridge::attach(
      self.remote.as_ref(),
      &self.config.path,
      Arc::new(self.clone()),
      self.cache.bus().clone(),
    )
  }

  // ===== Local snapshot =====

  fn outbox(&self) -> Outbox<T> {
    self
      .cache
      .store()
      .get(&self.config.key.outbox())
      .unwrap_or_default()
  }

  fn load(&self) -> (Vec<Record<T>>, Outbox<T>) {
    let records = self
      .cache
      .peek::<Vec<Record<T>>>(&self.config.key)
      .map(|entry| entry.data)
      .unwrap_or_default();
    let outbox = self.outbox();
    (overlay(records, &outbox), outbox)
  }

  /// Write the snapshot and its outbox in one batch.
  fn persist(&self, records: &[Record<T>], deletes: &[String]) -> Result<(), StoreError> {
    let outbox = Outbox {
      pending: records.iter().filter(|r| !r.synced).cloned().collect(),
      deletes: deletes.to_vec(),
    };
    let outbox_key = self.config.key.outbox();
    let mut batch = Batch::new();
    if outbox.is_empty() {
      batch.remove(outbox_key.as_str());
    } else {
      self.cache.store().stage(&mut batch, &outbox_key, &outbox)?;
    }
    self.cache.commit_local(&self.config.key, records, batch)?;
    Ok(())
  }

  fn publish(&self) {
    self.invalidate(self.cache.bus());
  }

  async fn lock_collection(&self) -> OwnedMutexGuard<()> {
    self.locks.lock(self.config.key.as_str()).await
  }

  async fn lock_record(&self, id: &str) -> OwnedMutexGuard<()> {
    self
      .locks
      .lock(&format!("{}#record/{}", self.config.key, id))
      .await
  }

  fn not_found(&self, id: &str) -> WriteError {
    WriteError::NotFound {
      entity: self.config.name.clone(),
      id: id.to_string(),
    }
  }

  fn decode(&self, docs: Vec<RemoteDocument>) -> Vec<Record<T>> {
    docs
      .into_iter()
      .filter_map(|doc| match Record::from_remote(doc) {
        Ok(record) => Some(record),
        Err(err) => {
          warn!(entity = %self.config.name, error = %err, "skipping malformed remote document");
          None
        }
      })
      .collect()
  }

  async fn fetch_merged(&self) -> Result<Vec<Record<T>>, FetchError> {
    let docs = self.remote.fetch_collection(&self.config.path).await?;
    let remote = self.decode(docs);
    let (local, outbox) = self.load();
    Ok(reconcile(&local, remote, &outbox.deletes))
  }

  // ===== Remote writes =====

  async fn push(&self, record: &Record<T>) -> PushOutcome {
    let write = match record.to_write() {
      Ok(write) => write,
      Err(err) => {
        warn!(entity = %self.config.name, id = %record.id, error = %err, "record does not serialize, not pushing");
        return PushOutcome::Deferred;
      }
    };

    let result = if record.is_provisional() {
      self
        .remote
        .create_record(&self.config.path, write)
        .await
        .map(PushOutcome::Created)
    } else {
      self
        .remote
        .update_record(&self.config.path, &record.id, write)
        .await
        .map(|()| PushOutcome::Updated)
    };

    match result {
      Ok(outcome) => outcome,
      Err(RemoteError::NotFound(_)) => PushOutcome::Gone,
      Err(err) => {
        debug!(entity = %self.config.name, id = %record.id, error = %err, "push failed, will retry");
        PushOutcome::Deferred
      }
    }
  }

  /// Push the pending state of record `id` and fold the result back into the
  /// snapshot. A record edited while the push was in flight stays unsynced.
  async fn push_one(&self, id: &str) -> Result<PushOutcome, StoreError> {
    let _record = self.lock_record(id).await;
    let Some(sent) = self.local().into_iter().find(|r| r.id == id && !r.synced) else {
      return Ok(PushOutcome::Skipped);
    };

    let outcome = self.push(&sent).await;

    let _guard = self.lock_collection().await;
    let (mut records, mut outbox) = self.load();
    if let PushOutcome::Created(new_id) = &outcome {
      records.retain(|r| r.id != *new_id);
    }
    let index = records.iter().position(|r| r.id == id);
    let unchanged = index.is_some_and(|i| records[i].last_modified == sent.last_modified);
    let changed = match (&outcome, index) {
      (PushOutcome::Updated, Some(i)) if unchanged => {
        records[i].synced = true;
        true
      }
      (PushOutcome::Created(new_id), Some(i)) => {
        records[i].id = new_id.clone();
        records[i].synced = unchanged;
        true
      }
      (PushOutcome::Created(new_id), None) => {
        // Deleted locally while the create was in flight
        outbox.deletes.push(new_id.clone());
        true
      }
      (PushOutcome::Gone, Some(i)) if unchanged => {
        debug!(entity = %self.config.name, id = %id, "record deleted remotely, dropping local copy");
        records.remove(i);
        true
      }
      _ => false,
    };
    if changed {
      self.persist(&records, &outbox.deletes)?;
    }
    Ok(outcome)
  }

  /// Delete record `id` remotely and clear its tombstone once confirmed.
  async fn push_delete(&self, id: &str) -> Result<PushOutcome, StoreError> {
    let _record = self.lock_record(id).await;
    if !self.outbox().deletes.iter().any(|d| d == id) {
      return Ok(PushOutcome::Skipped);
    }

    match self.remote.delete_record(&self.config.path, id).await {
      Ok(()) | Err(RemoteError::NotFound(_)) => {
        let _guard = self.lock_collection().await;
        let (records, mut outbox) = self.load();
        outbox.deletes.retain(|d| d != id);
        self.persist(&records, &outbox.deletes)?;
        Ok(PushOutcome::Deleted)
      }
      Err(err) => {
        debug!(entity = %self.config.name, id = %id, error = %err, "remote delete failed, will retry");
        Ok(PushOutcome::Deferred)
      }
    }
  }

  fn spawn_push(&self, id: String) {
    let service = self.clone();
    self.track(tokio::spawn(async move {
      if !service.remote.is_reachable().await {
        return;
      }
      match service.push_one(&id).await {
        Ok(PushOutcome::Deferred | PushOutcome::Skipped) => {}
        Ok(_) => service.publish(),
        Err(err) => warn!(entity = %service.config.name, id = %id, error = %err, "failed to record push result"),
      }
    }));
  }

  fn spawn_delete(&self, id: String) {
    let service = self.clone();
    self.track(tokio::spawn(async move {
      if !service.remote.is_reachable().await {
        return;
      }
      if let Err(err) = service.push_delete(&id).await {
        warn!(entity = %service.config.name, id = %id, error = %err, "failed to record delete result");
      }
    }));
  }

  fn track(&self, handle: JoinHandle<()>) {
    let mut background = self.background();
    background.retain(|h| !h.is_finished());
    background.push(handle);
  }

  fn background(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    self.background.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl SyncReport {
  fn count(&mut self, outcome: &PushOutcome) {
    match outcome {
      PushOutcome::Updated => self.pushed += 1,
      PushOutcome::Created(_) => self.created += 1,
      PushOutcome::Deleted => self.deleted += 1,
      PushOutcome::Gone => self.dropped += 1,
      PushOutcome::Deferred => self.deferred += 1,
      PushOutcome::Skipped => {}
    }
  }

  /// Whether the pass changed the local snapshot.
  pub fn changed(&self) -> bool {
    self.pushed + self.created + self.deleted + self.dropped > 0
  }
}

/// Apply pending writes from `outbox` on top of a persisted snapshot.
///
/// Unsynced records are only trusted if the outbox still holds them; a
/// snapshot written by an overlapping fetch can carry copies that have since
/// been pushed or deleted.
fn overlay<T: Clone>(mut records: Vec<Record<T>>, outbox: &Outbox<T>) -> Vec<Record<T>> {
  records.retain(|r| r.synced || outbox.pending.iter().any(|p| p.id == r.id));
  for pending in &outbox.pending {
    match records.iter_mut().find(|r| r.id == pending.id) {
      Some(existing) => {
        if pending.last_modified > existing.last_modified || !existing.synced {
          *existing = pending.clone();
        }
      }
      None => records.push(pending.clone()),
    }
  }
  records.retain(|r| !outbox.deletes.contains(&r.id));
  records
}

#[async_trait]
impl<T: Cacheable> SnapshotSink for EntitySyncService<T> {
  fn key(&self) -> &CacheKey {
    &self.config.key
  }

  /// Fold a pushed snapshot into the collection, keeping pending writes.
  async fn apply_snapshot(&self, docs: Vec<RemoteDocument>) -> Result<(), StoreError> {
    let remote = self.decode(docs);
    let _guard = self.lock_collection().await;
    let (local, outbox) = self.load();
    let merged = reconcile(&local, remote, &outbox.deletes);
    self.persist(&merged, &outbox.deletes)
  }

  fn invalidate(&self, bus: &MutationBus) {
    match &self.config.invalidate_prefix {
      Some(prefix) => bus.publish_prefix(prefix),
      None => bus.publish(&self.config.key),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, Clock, ManualClock};
  use crate::remote::MemoryRemote;
  use crate::store::{LocalStore, MemoryBackend};
  use serde::{Deserialize, Serialize};
  use serde_json::json;
  use crate::remote::{LiveSubscription, RemoteWrite, SnapshotCallback};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Territory {
    name: String,
    number: u32,
    #[serde(default)]
    note: Option<String>,
  }

  fn territory(name: &str, number: u32) -> Territory {
    Territory {
      name: name.to_string(),
      number,
      note: None,
    }
  }

  struct Fixture {
    service: EntitySyncService<Territory>,
    remote: Arc<MemoryRemote>,
    clock: Arc<ManualClock>,
    cache: OfflineCache,
  }

  fn fixture(config: EntityConfig) -> Fixture {
    let clock = Arc::new(ManualClock::default());
    let cache = OfflineCache::new(
      LocalStore::new(Arc::new(MemoryBackend::new())),
      MutationBus::new(),
      clock.clone(),
    );
    let remote = Arc::new(MemoryRemote::new());
    let service = EntitySyncService::new(
      config,
      remote.clone(),
      cache.clone(),
      Arc::new(KeyedLocks::new()),
      Arc::new(SyncLifecycle::new()),
    );
    Fixture {
      service,
      remote,
      clock,
      cache,
    }
  }

  /// Remote that lands creates and updates right away but holds their
  /// acknowledgement back for a while.
  struct SlowAcks {
    inner: Arc<MemoryRemote>,
    fail_fetch: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
  }

  impl SlowAcks {
    const DELAY: std::time::Duration = std::time::Duration::from_millis(20);

    fn new(inner: Arc<MemoryRemote>) -> Self {
      Self {
        inner,
        fail_fetch: AtomicBool::new(false),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
      }
    }
  }

  #[async_trait]
  impl RemoteStore for SlowAcks {
    async fn is_reachable(&self) -> bool {
      self.inner.is_reachable().await
    }

    async fn fetch_collection(&self, path: &str) -> Result<Vec<RemoteDocument>, RemoteError> {
      if self.fail_fetch.load(Ordering::SeqCst) {
        return Err(RemoteError::Unreachable("fetch timed out".to_string()));
      }
      self.inner.fetch_collection(path).await
    }

    async fn create_record(&self, path: &str, write: RemoteWrite) -> Result<String, RemoteError> {
      let id = self.inner.create_record(path, write).await?;
      tokio::time::sleep(Self::DELAY).await;
      Ok(id)
    }

    async fn update_record(
      &self,
      path: &str,
      id: &str,
      write: RemoteWrite,
    ) -> Result<(), RemoteError> {
      let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(running, Ordering::SeqCst);
      let result = self.inner.update_record(path, id, write).await;
      tokio::time::sleep(Self::DELAY).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      result
    }

    async fn delete_record(&self, path: &str, id: &str) -> Result<(), RemoteError> {
      self.inner.delete_record(path, id).await
    }

    fn subscribe_live(
      &self,
      path: &str,
      on_snapshot: SnapshotCallback,
    ) -> Result<LiveSubscription, RemoteError> {
      self.inner.subscribe_live(path, on_snapshot)
    }
  }

  fn slow_fixture(config: EntityConfig) -> (Fixture, Arc<SlowAcks>) {
    let f = fixture(config);
    let slow = Arc::new(SlowAcks::new(f.remote.clone()));
    let service = EntitySyncService::new(
      f.service.config().clone(),
      slow.clone(),
      f.cache.clone(),
      Arc::new(KeyedLocks::new()),
      Arc::new(SyncLifecycle::new()),
    );
    (Fixture { service, ..f }, slow)
  }

  async fn slow_seeded() -> (Fixture, Arc<SlowAcks>) {
    let (f, slow) = slow_fixture(EntityConfig::territories());
    f.remote.insert(
      "territories",
      "t1",
      json!({"name": "North", "number": 1}),
      Some(f.clock.now()),
    );
    f.service.sync_all().await.unwrap();
    (f, slow)
  }

  fn counter(cache: &OfflineCache, key: &CacheKey) -> (Arc<AtomicUsize>, crate::bus::Subscription) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let sub = cache.bus().subscribe(key, move |_| {
      seen.fetch_add(1, Ordering::SeqCst);
    });
    (hits, sub)
  }

  /// Seed remote record `t1` and pull it into the local snapshot.
  async fn seeded(config: EntityConfig) -> Fixture {
    let f = fixture(config);
    f.remote.insert(
      "territories",
      "t1",
      json!({"name": "North", "number": 1}),
      Some(f.clock.now()),
    );
    f.service.sync_all().await.unwrap();
    f
  }

  #[tokio::test]
  async fn test_create_offline_is_provisional() {
    let f = fixture(EntityConfig::territories());
    f.remote.set_online(false);
    let (hits, _sub) = counter(&f.cache, f.service.key());

    let record = f.service.create(territory("North", 1)).await.unwrap();

    assert!(record.is_provisional());
    assert!(!record.synced);
    assert_eq!(f.service.local(), vec![record]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_create_online_uses_remote_id() {
    let f = fixture(EntityConfig::territories());

    let record = f.service.create(territory("North", 1)).await.unwrap();

    assert_eq!(record.id, "doc-0001");
    assert!(record.synced);
    assert!(f.remote.document("territories", "doc-0001").is_some());
  }

  #[tokio::test]
  async fn test_require_remote_create_fails_offline() {
    let f = fixture(EntityConfig::groups());
    f.remote.set_online(false);

    let err = f.service.create(territory("G", 1)).await.unwrap_err();

    assert_eq!(
      err,
      WriteError::Offline {
        entity: "groups".to_string()
      }
    );
    assert!(f.service.local().is_empty());
  }

  #[tokio::test]
  async fn test_require_remote_create_surfaces_rejection() {
    let f = fixture(EntityConfig::groups());
    f.remote.set_reject_writes(true);

    let err = f.service.create(territory("G", 1)).await.unwrap_err();
    assert!(matches!(err, WriteError::Remote(RemoteError::Rejected(_))));
  }

  #[tokio::test]
  async fn test_update_is_visible_offline_through_resolve() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_online(false);
    f.clock.advance(Duration::minutes(1));

    f.service
      .update("t1", json!({"note": "dog in yard"}))
      .await
      .unwrap();
    let resolved = f.service.resolve().await.unwrap();

    assert_eq!(resolved.source, CacheSource::Offline);
    assert_eq!(resolved.data[0].data.note.as_deref(), Some("dog in yard"));
    assert!(!resolved.data[0].synced);
  }

  #[tokio::test]
  async fn test_update_online_pushes_in_background() {
    let f = seeded(EntityConfig::territories()).await;
    f.clock.advance(Duration::minutes(1));

    f.service.update("t1", json!({"number": 7})).await.unwrap();
    f.service.flush().await;

    let doc = f.remote.document("territories", "t1").unwrap();
    assert_eq!(doc.data["number"], json!(7));
    assert!(f.service.local()[0].synced);
  }

  #[tokio::test]
  async fn test_update_missing_record() {
    let f = fixture(EntityConfig::groups());
    let err = f.service.update("nope", json!({})).await.unwrap_err();
    assert!(matches!(err, WriteError::NotFound { .. }));
  }

  #[tokio::test]
  async fn test_update_many_is_all_or_nothing() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_online(false);

    let err = f
      .service
      .update_many(vec![
        ("t1".to_string(), json!({"note": "first"})),
        ("missing".to_string(), json!({"note": "second"})),
      ])
      .await
      .unwrap_err();

    assert!(matches!(err, WriteError::NotFound { .. }));
    assert_eq!(f.service.local()[0].data.note, None);
  }

  #[tokio::test]
  async fn test_sync_offline_returns_local_and_writes_nothing() {
    let f = fixture(EntityConfig::territories());
    f.remote.set_online(false);
    f.service.create(territory("North", 1)).await.unwrap();
    let before = f.cache.store().raw(f.service.key()).unwrap();

    let result = f.service.sync_all().await.unwrap();

    assert!(!result.is_authoritative());
    assert_eq!(result.records().len(), 1);
    assert_eq!(f.cache.store().raw(f.service.key()).unwrap(), before);
  }

  #[tokio::test]
  async fn test_sync_replaces_provisional_id_with_one_invalidation() {
    let f = fixture(EntityConfig::territories());
    f.remote.set_online(false);
    let draft = f.service.create(territory("North", 1)).await.unwrap();
    let (hits, _sub) = counter(&f.cache, f.service.key());

    f.remote.set_online(true);
    let result = f.service.sync_all().await.unwrap();

    let records = result.records();
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].id, draft.id);
    assert!(records[0].synced);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(matches!(
      result,
      SyncResult::Remote { ref report, .. } if report.created == 1
    ));
  }

  #[tokio::test]
  async fn test_sync_keeps_newer_unsynced_edit() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_reject_writes(true);
    f.clock.advance(Duration::seconds(1));

    f.service.update("t1", json!({"note": "mine"})).await.unwrap();
    f.service.flush().await;
    let result = f.service.sync_all().await.unwrap();

    let record = &result.records()[0];
    assert_eq!(record.data.note.as_deref(), Some("mine"));
    assert!(!record.synced);
  }

  #[tokio::test]
  async fn test_sync_prefers_newer_remote_write() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_reject_writes(true);
    f.clock.advance(Duration::seconds(1));
    f.service.update("t1", json!({"note": "mine"})).await.unwrap();
    f.service.flush().await;

    f.remote.insert(
      "territories",
      "t1",
      json!({"name": "North", "number": 1, "note": "theirs"}),
      Some(f.clock.now() + Duration::seconds(1)),
    );
    let result = f.service.sync_all().await.unwrap();

    let record = &result.records()[0];
    assert_eq!(record.data.note.as_deref(), Some("theirs"));
    assert!(record.synced);
  }

  #[tokio::test]
  async fn test_push_to_remotely_deleted_record_drops_it() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_online(false);
    f.clock.advance(Duration::seconds(1));
    f.service.update("t1", json!({"note": "late"})).await.unwrap();
    f.service.flush().await;
    f.remote.remove("territories", "t1");

    f.remote.set_online(true);
    let result = f.service.sync_all().await.unwrap();

    assert!(result.records().is_empty());
    assert!(matches!(
      result,
      SyncResult::Remote { ref report, .. } if report.dropped == 1
    ));
  }

  #[tokio::test]
  async fn test_delete_offline_is_retried_by_sync() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_online(false);

    f.service.delete("t1").await.unwrap();
    f.service.flush().await;
    assert!(f.service.local().is_empty());
    assert!(f.remote.document("territories", "t1").is_some());

    f.remote.set_online(true);
    let result = f.service.sync_all().await.unwrap();

    assert!(result.records().is_empty());
    assert!(f.remote.document("territories", "t1").is_none());
    assert!(f.cache.store().raw(&f.service.key().outbox()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_delete_provisional_never_reaches_remote() {
    let f = fixture(EntityConfig::territories());
    f.remote.set_online(false);
    let draft = f.service.create(territory("North", 1)).await.unwrap();

    f.service.delete(&draft.id).await.unwrap();
    f.remote.set_online(true);
    f.service.sync_all().await.unwrap();

    assert_eq!(f.remote.write_count(), 0);
    assert!(f.service.local().is_empty());
  }

  #[tokio::test]
  async fn test_pending_writes_survive_cleared_snapshot() {
    let f = seeded(EntityConfig::territories()).await;
    f.remote.set_online(false);
    f.clock.advance(Duration::seconds(1));
    f.service.update("t1", json!({"note": "keep"})).await.unwrap();

    f.cache.store().remove(f.service.key()).unwrap();

    let local = f.service.local();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].data.note.as_deref(), Some("keep"));
  }

  #[tokio::test]
  async fn test_ensure_synced_runs_once() {
    let f = fixture(EntityConfig::territories());
    f.remote.set_online(false);
    assert!(f.service.ensure_synced().await.unwrap().is_some());

    f.remote.set_online(true);
    assert!(f.service.ensure_synced().await.unwrap().is_some());
    assert!(f.service.ensure_synced().await.unwrap().is_none());
    assert_eq!(f.remote.fetch_count(), 1);
  }

  #[tokio::test]
  async fn test_house_writes_invalidate_every_house_list() {
    let f = fixture(EntityConfig::houses("t-1"));
    f.remote.set_online(false);
    let other = CacheKey::scoped("houses", "t-2");
    let (hits, _sub) = counter(&f.cache, &other);

    f.service.create(territory("12 Elm", 12)).await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_online_create_racing_live_snapshot_keeps_one_copy() {
    let (f, _slow) = slow_fixture(EntityConfig::territories());
    let bridge = f.service.watch();

    let record = f.service.create(territory("North", 1)).await.unwrap();
    bridge.detach().await;

    let ids: Vec<String> = f.service.local().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![record.id]);
  }

  #[tokio::test]
  async fn test_sync_create_racing_live_snapshot_keeps_one_copy() {
    let (f, slow) = slow_fixture(EntityConfig::territories());
    f.remote.set_online(false);
    f.service.create(territory("North", 1)).await.unwrap();
    f.remote.set_online(true);
    let bridge = f.service.watch();
    slow.fail_fetch.store(true, Ordering::SeqCst);

    let result = f.service.sync_all().await.unwrap();
    bridge.detach().await;

    assert!(!result.is_authoritative());
    let local = f.service.local();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, "doc-0001");
    assert!(local[0].synced);
  }

  #[tokio::test]
  async fn test_pushes_for_one_record_run_one_at_a_time() {
    let (f, slow) = slow_seeded().await;

    f.service.update("t1", json!({"number": 2})).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    f.service.update("t1", json!({"number": 3})).await.unwrap();
    f.service.flush().await;

    assert_eq!(slow.max_in_flight.load(Ordering::SeqCst), 1);
    let doc = f.remote.document("territories", "t1").unwrap();
    assert_eq!(doc.data["number"], json!(3));
    let local = f.service.local();
    assert_eq!(local[0].data.number, 3);
    assert!(local[0].synced);
  }

  #[tokio::test]
  async fn test_edit_during_push_stays_unsynced() {
    let (f, _slow) = slow_seeded().await;

    f.service.update("t1", json!({"number": 2})).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    f.remote.set_online(false);
    f.service.update("t1", json!({"number": 3})).await.unwrap();
    f.service.flush().await;

    let doc = f.remote.document("territories", "t1").unwrap();
    assert_eq!(doc.data["number"], json!(2));
    let local = f.service.local();
    assert_eq!(local[0].data.number, 3);
    assert!(!local[0].synced);
  }

  #[tokio::test]
  async fn test_live_house_snapshot_invalidates_every_house_list() {
    let f = fixture(EntityConfig::houses("t-1"));
    let other = CacheKey::scoped("houses", "t-2");
    let (hits, _sub) = counter(&f.cache, &other);
    let bridge = f.service.watch();

    f.remote.insert(
      "avoidHouses/t-1",
      "h1",
      json!({"name": "12 Elm", "number": 12}),
      Some(f.clock.now()),
    );
    bridge.detach().await;

    assert!(hits.load(Ordering::SeqCst) >= 1);
    assert_eq!(f.service.local().len(), 1);
  }

  #[test]
  fn test_overlay_drops_untracked_unsynced_copies() {
    let now = chrono::Utc::now();
    let stale = Record {
      id: "local-1".to_string(),
      data: 1,
      last_modified: now,
      synced: false,
    };
    let kept = Record {
      id: "a".to_string(),
      data: 2,
      last_modified: now,
      synced: true,
    };
    let outbox = Outbox {
      pending: Vec::new(),
      deletes: vec!["b".to_string()],
    };

    let records = overlay(vec![stale, kept.clone()], &outbox);
    assert_eq!(records, vec![kept]);
  }
}
