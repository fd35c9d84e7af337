//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Values that can be persisted in the offline cache.
///
/// Implemented for every type that is cloneable, thread-safe and serde
/// round-trippable; the cache does not care what the shape is.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Persisted form of a cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  /// When the value was last confirmed, either fetched from the remote store
  /// or written by the collection's owner. Never moves backwards for a key.
  pub fetched_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self { data, fetched_at }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.fetched_at
  }

  /// Whether the entry may still be served at `now` under `ttl`.
  pub fn is_within(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
    self.age(now) <= ttl
  }
}

/// Result of a resolve, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the served value was fetched
  pub fetched_at: DateTime<Utc>,
}

impl<T> Resolved<T> {
  /// Fresh data from the remote store.
  pub fn from_network(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
    }
  }

  /// Cached data served because the remote fetch failed.
  pub fn offline(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      fetched_at,
    }
  }

  /// True when the caller is looking at a fallback copy.
  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::Offline
  }

  pub fn into_data(self) -> T {
    self.data
  }
}

/// Indicates where resolved data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable, serving cached data within its TTL
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_ttl_boundary_is_inclusive() {
    let t0 = Utc::now();
    let entry = CacheEntry::new(1, t0);
    let ttl = Duration::hours(24);

    assert!(entry.is_within(ttl, t0 + ttl));
    assert!(!entry.is_within(ttl, t0 + ttl + Duration::seconds(1)));
  }

  #[test]
  fn test_offline_result_is_stale() {
    let now = Utc::now();
    assert!(Resolved::offline(1, now).is_stale());
    assert!(!Resolved::from_network(1, now).is_stale());
  }
}
