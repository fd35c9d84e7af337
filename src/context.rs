//! Application-wide wiring.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::bus::{MutationBus, Subscription};
use crate::cache::{CacheKey, Cacheable, Clock, OfflineCache, Resolved, SystemClock};
use crate::config::{ttl_from_secs, Config, EntitySettings};
use crate::error::{CacheError, FetchError, StoreError};
use crate::live::{DocumentSink, LiveBridge};
use crate::remote::RemoteStore;
use crate::store::{KvBackend, LocalStore, SqliteBackend};
use crate::sync::{EntityConfig, EntitySyncService, KeyedLocks, SyncLifecycle};

/// Owns the shared pieces every reader and writer works through: the local
/// store, the offline cache, the mutation bus, the clock, and the session's
/// sync lifecycle. Entity services built from one context share all of them.
#[derive(Clone)]
pub struct AppContext {
  cache: OfflineCache,
  remote: Arc<dyn RemoteStore>,
  lifecycle: Arc<SyncLifecycle>,
  locks: Arc<KeyedLocks>,
  default_ttl: Option<Duration>,
  entities: HashMap<String, EntitySettings>,
}

impl AppContext {
  pub fn new(
    backend: Arc<dyn KvBackend>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let cache = OfflineCache::new(LocalStore::new(backend), MutationBus::new(), clock);
    Self {
      cache,
      remote,
      lifecycle: Arc::new(SyncLifecycle::new()),
      locks: Arc::new(KeyedLocks::new()),
      default_ttl: None,
      entities: HashMap::new(),
    }
  }

  /// Context backed by the SQLite cache named in `config`, with its TTL and
  /// per-entity overrides applied to every service it builds.
  pub fn open(config: &Config, remote: Arc<dyn RemoteStore>) -> Result<Self, StoreError> {
    let path = config
      .database_path()
      .ok_or_else(|| StoreError::Backend("could not determine cache database path".to_string()))?;
    let backend = SqliteBackend::open(&path)?;
    info!(path = %path.display(), "opened offline cache");

    let mut context = Self::new(Arc::new(backend), remote, Arc::new(SystemClock));
    context.default_ttl = config.default_ttl.and_then(ttl_from_secs);
    context.entities = config.entities.clone();
    Ok(context)
  }

  pub fn cache(&self) -> &OfflineCache {
    &self.cache
  }

  pub fn bus(&self) -> &MutationBus {
    self.cache.bus()
  }

  pub fn remote(&self) -> &Arc<dyn RemoteStore> {
    &self.remote
  }

  pub fn lifecycle(&self) -> &Arc<SyncLifecycle> {
    &self.lifecycle
  }

  /// Build the sync service for one entity collection.
  pub fn entity<T: Cacheable>(&self, config: EntityConfig) -> EntitySyncService<T> {
    let mut config = config;
    if let Some(ttl) = self.default_ttl {
      config = config.with_ttl(ttl);
    }
    if let Some(settings) = self.entities.get(&config.name) {
      config = config.with_settings(settings);
    }
    EntitySyncService::new(
      config,
      Arc::clone(&self.remote),
      self.cache.clone(),
      Arc::clone(&self.locks),
      Arc::clone(&self.lifecycle),
    )
  }

  /// Read `key` through the offline cache.
  pub async fn resolve<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetch: F,
    ttl: Duration,
  ) -> Result<Resolved<T>, CacheError>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, FetchError>>,
  {
    self.cache.resolve(key, fetch, ttl).await
  }

  /// Be told whenever `key` changes.
  pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
  where
    F: Fn(&CacheKey) + Send + Sync + 'static,
  {
    self.bus().subscribe(key, callback)
  }

  /// Mirror the raw documents of remote collection `path` into `key`.
  pub fn watch_documents(&self, key: CacheKey, path: &str) -> LiveBridge {
    let sink = Arc::new(DocumentSink::new(key, self.cache.clone()));
    LiveBridge::attach(self.remote.as_ref(), path, sink, self.bus().clone())
  }

  /// Drop every cached collection, e.g. on sign-out.
  pub fn clear_all(&self) -> Result<Vec<CacheKey>, StoreError> {
    self.lifecycle.reset();
    self.cache.clear_all()
  }
}
