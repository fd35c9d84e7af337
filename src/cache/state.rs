//! Per-key fetch state machine.
//!
//! ```text
//! Idle ──begin──▶ Fetching ──ok──────────▶ Fresh
//!                    │ └────fallback──────▶ Stale
//!                    └──────miss/expired──▶ Error
//! ```
//!
//! Overlapping resolves on the same key each take a ticket. Only a ticket
//! newer than the last settled one may change the state, so a slow fetch
//! finishing after a faster, newer one cannot roll the state back.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::CacheKey;
use crate::error::CacheError;

/// Observable state of one cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyState {
  /// Never resolved (or cleared) in this process
  Idle,
  /// A resolve is in flight
  Fetching,
  /// Last resolve returned remote data
  Fresh { fetched_at: DateTime<Utc> },
  /// Last resolve fell back to cached data within its TTL
  Stale { fetched_at: DateTime<Utc> },
  /// Last resolve failed with nothing servable
  Error(CacheError),
}

impl KeyState {
  pub fn is_fetching(&self) -> bool {
    matches!(self, KeyState::Fetching)
  }

  pub fn is_fresh(&self) -> bool {
    matches!(self, KeyState::Fresh { .. })
  }

  pub fn is_stale(&self) -> bool {
    matches!(self, KeyState::Stale { .. })
  }

  pub fn error(&self) -> Option<&CacheError> {
    match self {
      KeyState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Proof that a resolve was started; hand it back to [`KeyRegistry::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug)]
struct KeyStatus {
  state: KeyState,
  issued: u64,
  settled: u64,
  last_stamp: Option<DateTime<Utc>>,
}

impl Default for KeyStatus {
  fn default() -> Self {
    Self {
      state: KeyState::Idle,
      issued: 0,
      settled: 0,
      last_stamp: None,
    }
  }
}

/// Tracks [`KeyState`] and write stamps for every key touched in this process.
#[derive(Debug, Default)]
pub struct KeyRegistry {
  keys: Mutex<HashMap<CacheKey, KeyStatus>>,
}

impl KeyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_status<R>(&self, key: &CacheKey, f: impl FnOnce(&mut KeyStatus) -> R) -> R {
    let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
    f(keys.entry(key.clone()).or_default())
  }

  pub fn state(&self, key: &CacheKey) -> KeyState {
    let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
    keys
      .get(key)
      .map(|status| status.state.clone())
      .unwrap_or(KeyState::Idle)
  }

  /// Move `key` to `Fetching` and return the ticket for this attempt.
  pub fn begin(&self, key: &CacheKey) -> Ticket {
    self.with_status(key, |status| {
      status.issued += 1;
      status.state = KeyState::Fetching;
      Ticket(status.issued)
    })
  }

  /// Record the outcome of the attempt identified by `ticket`.
  ///
  /// Returns `false` when a newer attempt already settled; the caller must
  /// then not persist its result. While newer attempts are still in flight
  /// the key stays `Fetching`.
  pub fn settle(&self, key: &CacheKey, ticket: Ticket, outcome: KeyState) -> bool {
    self.with_status(key, |status| {
      if ticket.0 <= status.settled {
        return false;
      }
      status.settled = ticket.0;
      if ticket.0 == status.issued {
        status.state = outcome;
      }
      true
    })
  }

  /// Return a timestamp for a write to `key` that is no earlier than any
  /// previous one handed out for that key.
  pub fn stamp(&self, key: &CacheKey, now: DateTime<Utc>) -> DateTime<Utc> {
    self.with_status(key, |status| {
      let stamp = match status.last_stamp {
        Some(last) if last > now => last,
        _ => now,
      };
      status.last_stamp = Some(stamp);
      stamp
    })
  }

  /// Note a stamp read back from storage so later stamps never precede it.
  pub fn observe(&self, key: &CacheKey, stamp: DateTime<Utc>) {
    self.with_status(key, |status| {
      if status.last_stamp.map_or(true, |last| stamp > last) {
        status.last_stamp = Some(stamp);
      }
    });
  }

  /// Forget everything about `key`.
  pub fn reset(&self, key: &CacheKey) {
    let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
    keys.remove(key);
  }

  pub fn reset_all(&self) {
    let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
    keys.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_unknown_key_is_idle() {
    let registry = KeyRegistry::new();
    assert_eq!(registry.state(&CacheKey::new("x")), KeyState::Idle);
  }

  #[test]
  fn test_begin_then_settle() {
    let registry = KeyRegistry::new();
    let key = CacheKey::new("territories");
    let now = Utc::now();

    let ticket = registry.begin(&key);
    assert!(registry.state(&key).is_fetching());

    assert!(registry.settle(&key, ticket, KeyState::Fresh { fetched_at: now }));
    assert!(registry.state(&key).is_fresh());
  }

  #[test]
  fn test_older_attempt_cannot_overwrite_newer() {
    let registry = KeyRegistry::new();
    let key = CacheKey::new("territories");
    let now = Utc::now();

    let first = registry.begin(&key);
    let second = registry.begin(&key);

    assert!(registry.settle(&key, second, KeyState::Fresh { fetched_at: now }));
    assert!(!registry.settle(&key, first, KeyState::Stale { fetched_at: now }));
    assert!(registry.state(&key).is_fresh());
  }

  #[test]
  fn test_older_attempt_settling_first_keeps_fetching() {
    let registry = KeyRegistry::new();
    let key = CacheKey::new("territories");
    let now = Utc::now();

    let first = registry.begin(&key);
    let second = registry.begin(&key);

    assert!(registry.settle(&key, first, KeyState::Fresh { fetched_at: now }));
    assert!(registry.state(&key).is_fetching());
    assert!(registry.settle(&key, second, KeyState::Stale { fetched_at: now }));
    assert!(registry.state(&key).is_stale());
  }

  #[test]
  fn test_stamps_never_go_backwards() {
    let registry = KeyRegistry::new();
    let key = CacheKey::new("groups");
    let now = Utc::now();

    assert_eq!(registry.stamp(&key, now), now);
    assert_eq!(registry.stamp(&key, now - Duration::minutes(5)), now);

    registry.observe(&key, now + Duration::minutes(1));
    assert_eq!(registry.stamp(&key, now), now + Duration::minutes(1));
  }
}
