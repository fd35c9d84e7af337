//! Remote document store collaborator.
//!
//! The sync layer never talks to a concrete backend; it consumes
//! [`RemoteStore`]. [`MemoryRemote`] is an in-process implementation with a
//! connectivity switch, used by tests and local runs.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

pub use memory::MemoryRemote;

/// A document as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
  pub id: String,
  pub data: Value,
  /// Last write time recorded by the remote store, if it tracks one.
  pub modified_at: Option<DateTime<Utc>>,
}

/// Body of a create or update sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWrite {
  pub data: Value,
  pub modified_at: DateTime<Utc>,
}

/// Callback invoked with the full collection on every server push.
pub type SnapshotCallback = Box<dyn Fn(Vec<RemoteDocument>) + Send + Sync>;

/// Handle to a live subscription. Dropping it unsubscribes.
#[must_use = "dropping a LiveSubscription unsubscribes immediately"]
pub struct LiveSubscription {
  cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl LiveSubscription {
  pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
    Self {
      cancel: Some(Box::new(cancel)),
    }
  }

  pub fn unsubscribe(mut self) {
    self.cancel_now();
  }

  fn cancel_now(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl Drop for LiveSubscription {
  fn drop(&mut self) {
    self.cancel_now();
  }
}

impl std::fmt::Debug for LiveSubscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LiveSubscription")
      .field("active", &self.cancel.is_some())
      .finish()
  }
}

/// Operations the sync layer needs from the remote document store.
///
/// Paths name a collection (`"territories"`, `"avoidHouses/t-1"`); their
/// interpretation is up to the implementation.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Cheap connectivity probe consulted before remote writes.
  async fn is_reachable(&self) -> bool;

  async fn fetch_collection(&self, path: &str) -> Result<Vec<RemoteDocument>, RemoteError>;

  /// Create a document and return its authoritative id.
  async fn create_record(&self, path: &str, write: RemoteWrite) -> Result<String, RemoteError>;

  /// Merge `write.data` into an existing document.
  async fn update_record(&self, path: &str, id: &str, write: RemoteWrite)
    -> Result<(), RemoteError>;

  async fn delete_record(&self, path: &str, id: &str) -> Result<(), RemoteError>;

  /// Start pushing snapshots of `path` to `on_snapshot`.
  fn subscribe_live(
    &self,
    path: &str,
    on_snapshot: SnapshotCallback,
  ) -> Result<LiveSubscription, RemoteError>;
}
