//! Offline cache wrapper that orchestrates caching logic with network fetching.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::clock::Clock;
use super::state::{KeyRegistry, KeyState};
use super::traits::{CacheEntry, Cacheable, Resolved};
use super::CacheKey;
use crate::bus::MutationBus;
use crate::error::{CacheError, FetchError, StoreError};
use crate::store::{Batch, LocalStore};

/// Wraps remote fetches with TTL-bounded fallback to the local store.
///
/// Every successful fetch refreshes the persisted copy. A failed fetch is
/// answered from the persisted copy only while it is within the caller's TTL;
/// past that the copy is dropped and the fetch error surfaces.
#[derive(Clone)]
pub struct OfflineCache {
  store: LocalStore,
  bus: MutationBus,
  clock: Arc<dyn Clock>,
  registry: Arc<KeyRegistry>,
}

impl OfflineCache {
  pub fn new(store: LocalStore, bus: MutationBus, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      bus,
      clock,
      registry: Arc::new(KeyRegistry::new()),
    }
  }

  pub fn store(&self) -> &LocalStore {
    &self.store
  }

  pub fn bus(&self) -> &MutationBus {
    &self.bus
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Current fetch state of `key`.
  pub fn state(&self, key: &CacheKey) -> KeyState {
    self.registry.state(key)
  }

  /// Fetch `key` through `fetch`, falling back to the cached copy.
  ///
  /// 1. Call the fetcher
  /// 2. On success, persist `{data, fetched_at: now}` and return it
  /// 3. On failure, serve the cached copy if it is no older than `ttl`
  /// 4. Otherwise clear any expired copy and return the fetch error
  ///
  /// Concurrent resolves of one key are not deduplicated.
  pub async fn resolve<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetch: F,
    ttl: Duration,
  ) -> Result<Resolved<T>, CacheError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    let ticket = self.registry.begin(key);

    match fetch().await {
      Ok(data) => {
        let fetched_at = self.registry.stamp(key, self.clock.now());
        let outcome = KeyState::Fresh { fetched_at };
        if self.registry.settle(key, ticket, outcome) {
          let entry = CacheEntry::new(&data, fetched_at);
          if let Err(err) = self.store.set(key, &entry) {
            // Still hand the data out; the next success retries the write
            warn!(key = %key, error = %err, "failed to persist fetched data");
          }
        } else {
          debug!(key = %key, "newer resolve already settled, not persisting");
        }
        Ok(Resolved::from_network(data, fetched_at))
      }
      Err(source) => {
        let now = self.clock.now();
        match self.store.get::<CacheEntry<T>>(key) {
          None => {
            let err = CacheError::Unavailable {
              key: key.to_string(),
              source,
            };
            self.registry.settle(key, ticket, KeyState::Error(err.clone()));
            Err(err)
          }
          Some(entry) if entry.is_within(ttl, now) => {
            debug!(key = %key, age = %entry.age(now), "serving cached data after failed fetch");
            self.registry.observe(key, entry.fetched_at);
            self.registry.settle(
              key,
              ticket,
              KeyState::Stale {
                fetched_at: entry.fetched_at,
              },
            );
            Ok(Resolved::offline(entry.data, entry.fetched_at))
          }
          Some(entry) => {
            warn!(key = %key, age = %entry.age(now), "cached data expired, clearing");
            if let Err(err) = self.store.remove(key) {
              warn!(key = %key, error = %err, "failed to clear expired entry");
            }
            let err = CacheError::Expired {
              key: key.to_string(),
              source,
            };
            self.registry.settle(key, ticket, KeyState::Error(err.clone()));
            Err(err)
          }
        }
      }
    }
  }

  /// Read the persisted entry for `key` without fetching or TTL checks.
  pub fn peek<T: Cacheable>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
    let entry = self.store.get::<CacheEntry<T>>(key)?;
    self.registry.observe(key, entry.fetched_at);
    Some(entry)
  }

  /// Persist `data` under `key` as written by the collection's owner,
  /// together with any extra operations already staged in `batch`.
  ///
  /// The whole batch commits atomically. Returns the entry's stamp.
  pub fn commit_local<D: Serialize + ?Sized>(
    &self,
    key: &CacheKey,
    data: &D,
    mut batch: Batch,
  ) -> Result<DateTime<Utc>, StoreError> {
    let stamp = self.registry.stamp(key, self.clock.now());
    self
      .store
      .stage(&mut batch, key, &CacheEntry::new(data, stamp))?;
    self.store.commit(&batch)?;
    Ok(stamp)
  }

  /// Remove the cached copy of `key` and notify its subscribers.
  pub fn clear(&self, key: &CacheKey) -> Result<(), StoreError> {
    self.store.remove(key)?;
    self.registry.reset(key);
    self.bus.publish(key);
    Ok(())
  }

  /// Remove every cached key and notify each key's subscribers.
  pub fn clear_all(&self) -> Result<Vec<CacheKey>, StoreError> {
    let keys = self.store.keys()?;
    self.store.clear()?;
    self.registry.reset_all();
    for key in &keys {
      self.bus.publish(key);
    }
    Ok(keys)
  }
}
