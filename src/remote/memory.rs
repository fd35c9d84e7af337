use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{LiveSubscription, RemoteDocument, RemoteStore, RemoteWrite, SnapshotCallback};
use crate::error::RemoteError;

type SharedCallback = Arc<SnapshotCallback>;

#[derive(Default)]
struct Subscribers {
  next_id: u64,
  by_path: HashMap<String, Vec<(u64, SharedCallback)>>,
}

/// In-process remote document store.
///
/// Collections keep insertion order. Every successful write pushes a fresh
/// snapshot to live subscribers of the written path. Connectivity and write
/// rejection can be toggled to exercise offline paths.
pub struct MemoryRemote {
  collections: Mutex<HashMap<String, Vec<RemoteDocument>>>,
  subscribers: Arc<Mutex<Subscribers>>,
  online: AtomicBool,
  reject_writes: AtomicBool,
  next_id: AtomicU64,
  fetches: AtomicUsize,
  writes: AtomicUsize,
}

impl Default for MemoryRemote {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self {
      collections: Mutex::new(HashMap::new()),
      subscribers: Arc::new(Mutex::new(Subscribers::default())),
      online: AtomicBool::new(true),
      reject_writes: AtomicBool::new(false),
      next_id: AtomicU64::new(1),
      fetches: AtomicUsize::new(0),
      writes: AtomicUsize::new(0),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// While set, reachable writes fail with [`RemoteError::Rejected`].
  pub fn set_reject_writes(&self, reject: bool) {
    self.reject_writes.store(reject, Ordering::SeqCst);
  }

  /// Insert or replace a document as if another client wrote it.
  pub fn insert(&self, path: &str, id: &str, data: Value, modified_at: Option<DateTime<Utc>>) {
    {
      let mut collections = self.collections();
      let docs = collections.entry(path.to_string()).or_default();
      let doc = RemoteDocument {
        id: id.to_string(),
        data,
        modified_at,
      };
      match docs.iter_mut().find(|d| d.id == id) {
        Some(existing) => *existing = doc,
        None => docs.push(doc),
      }
    }
    self.push(path);
  }

  /// Remove a document as if another client deleted it.
  pub fn remove(&self, path: &str, id: &str) {
    if let Some(docs) = self.collections().get_mut(path) {
      docs.retain(|d| d.id != id);
    }
    self.push(path);
  }

  pub fn documents(&self, path: &str) -> Vec<RemoteDocument> {
    self.collections().get(path).cloned().unwrap_or_default()
  }

  pub fn document(&self, path: &str, id: &str) -> Option<RemoteDocument> {
    self
      .collections()
      .get(path)
      .and_then(|docs| docs.iter().find(|d| d.id == id).cloned())
  }

  /// Number of `fetch_collection` calls served.
  pub fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  /// Number of successful create/update/delete calls.
  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn subscriber_count(&self, path: &str) -> usize {
    lock(&self.subscribers)
      .by_path
      .get(path)
      .map_or(0, Vec::len)
  }

  /// Send the current snapshot of `path` to its live subscribers.
  pub fn push(&self, path: &str) {
    if !self.is_online() {
      return;
    }
    let callbacks: Vec<SharedCallback> = lock(&self.subscribers)
      .by_path
      .get(path)
      .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
      .unwrap_or_default();
    if callbacks.is_empty() {
      return;
    }
    let snapshot = self.documents(path);
    for callback in callbacks {
      callback(snapshot.clone());
    }
  }

  fn collections(&self) -> MutexGuard<'_, HashMap<String, Vec<RemoteDocument>>> {
    lock(&self.collections)
  }

  fn check_online(&self) -> Result<(), RemoteError> {
    if self.is_online() {
      Ok(())
    } else {
      Err(RemoteError::Unreachable("network is offline".to_string()))
    }
  }

  fn check_writable(&self) -> Result<(), RemoteError> {
    self.check_online()?;
    if self.reject_writes.load(Ordering::SeqCst) {
      return Err(RemoteError::Rejected("writes are disabled".to_string()));
    }
    Ok(())
  }

  fn wrote(&self, path: &str) {
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.push(path);
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn merge_fields(target: &mut Value, patch: Value) {
  match (target, patch) {
    (Value::Object(fields), Value::Object(patch)) => {
      for (name, value) in patch {
        fields.insert(name, value);
      }
    }
    (target, patch) => *target = patch,
  }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
  async fn is_reachable(&self) -> bool {
    self.is_online()
  }

  async fn fetch_collection(&self, path: &str) -> Result<Vec<RemoteDocument>, RemoteError> {
    self.check_online()?;
    self.fetches.fetch_add(1, Ordering::SeqCst);
    Ok(self.documents(path))
  }

  async fn create_record(&self, path: &str, write: RemoteWrite) -> Result<String, RemoteError> {
    self.check_writable()?;
    let id = format!("doc-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
    self
      .collections()
      .entry(path.to_string())
      .or_default()
      .push(RemoteDocument {
        id: id.clone(),
        data: write.data,
        modified_at: Some(write.modified_at),
      });
    self.wrote(path);
    Ok(id)
  }

  async fn update_record(
    &self,
    path: &str,
    id: &str,
    write: RemoteWrite,
  ) -> Result<(), RemoteError> {
    self.check_writable()?;
    {
      let mut collections = self.collections();
      let doc = collections
        .get_mut(path)
        .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
        .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", path, id)))?;
      merge_fields(&mut doc.data, write.data);
      doc.modified_at = Some(write.modified_at);
    }
    self.wrote(path);
    Ok(())
  }

  async fn delete_record(&self, path: &str, id: &str) -> Result<(), RemoteError> {
    self.check_writable()?;
    {
      let mut collections = self.collections();
      let docs = collections
        .get_mut(path)
        .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", path, id)))?;
      let before = docs.len();
      docs.retain(|d| d.id != id);
      if docs.len() == before {
        return Err(RemoteError::NotFound(format!("{}/{}", path, id)));
      }
    }
    self.wrote(path);
    Ok(())
  }

  fn subscribe_live(
    &self,
    path: &str,
    on_snapshot: SnapshotCallback,
  ) -> Result<LiveSubscription, RemoteError> {
    self.check_online()?;
    let id = {
      let mut subscribers = lock(&self.subscribers);
      let id = subscribers.next_id;
      subscribers.next_id += 1;
      subscribers
        .by_path
        .entry(path.to_string())
        .or_default()
        .push((id, Arc::new(on_snapshot)));
      id
    };

    // Like a real listener, deliver the current state straight away
    self.push(path);

    let subscribers = Arc::clone(&self.subscribers);
    let path = path.to_string();
    Ok(LiveSubscription::new(move || {
      let mut subscribers = lock(&subscribers);
      if let Some(subs) = subscribers.by_path.get_mut(&path) {
        subs.retain(|(sub_id, _)| *sub_id != id);
      }
    }))
  }
}
