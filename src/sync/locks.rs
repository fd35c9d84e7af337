use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Named async locks, created on first use.
///
/// Used twice: once keyed by collection so read-modify-write passes on one
/// snapshot never interleave, once keyed by record so remote writes for one
/// record run one at a time. When both are needed the record lock is taken
/// first.
#[derive(Debug, Default)]
pub struct KeyedLocks {
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `name`.
  pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      // Drop locks nobody holds or waits on
      locks.retain(|_, lock| Arc::strong_count(lock) > 1);
      Arc::clone(locks.entry(name.to_string()).or_default())
    };
    lock.lock_owned().await
  }

  /// Number of locks currently held or awaited.
  pub fn active(&self) -> usize {
    let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
      .values()
      .filter(|lock| Arc::strong_count(lock) > 1)
      .count()
  }
}
