use std::collections::HashSet;
use std::sync::Mutex;

use crate::cache::CacheKey;

/// Which collections have completed a reachable sync in this app session.
///
/// Owned by the application context and shared with every entity service,
/// so "sync once on startup" is decided per session rather than per process.
#[derive(Debug, Default)]
pub struct SyncLifecycle {
  synced: Mutex<HashSet<CacheKey>>,
}

impl SyncLifecycle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn has_synced(&self, key: &CacheKey) -> bool {
    self
      .synced
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains(key)
  }

  pub fn mark_synced(&self, key: &CacheKey) {
    self
      .synced
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(key.clone());
  }

  /// Forget every key, e.g. after sign-out.
  pub fn reset(&self) {
    self
      .synced
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clear();
  }
}
