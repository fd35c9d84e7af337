//! Error types for the cache and sync layer.
//!
//! Every public operation returns one of these instead of panicking. None of
//! them is fatal: store failures degrade to cache misses, remote failures are
//! deferred to the next sync pass.

use thiserror::Error;

/// Failure of the local key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
  #[error("storage backend error: {0}")]
  Backend(String),

  #[error("failed to serialize value for {key}: {message}")]
  Serialize { key: String, message: String },

  #[error("corrupt value for {key}: {message}")]
  Corrupt { key: String, message: String },

  #[error("lock poisoned: {0}")]
  Poisoned(String),
}

impl From<rusqlite::Error> for StoreError {
  fn from(err: rusqlite::Error) -> Self {
    StoreError::Backend(err.to_string())
  }
}

/// Failure reported by the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  #[error("remote store unreachable: {0}")]
  Unreachable(String),

  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("rejected by remote store: {0}")]
  Rejected(String),

  #[error("record not found: {0}")]
  NotFound(String),
}

/// Error returned by a fetcher handed to [`crate::cache::OfflineCache::resolve`].
pub type FetchError = RemoteError;

/// Failure of a cached read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// Fetch failed and nothing was cached for the key.
  #[error("{key} unavailable: {source}")]
  Unavailable { key: String, source: FetchError },

  /// Fetch failed and the cached value was older than its TTL. The entry has
  /// been cleared.
  #[error("cached {key} expired: {source}")]
  Expired { key: String, source: FetchError },
}

impl CacheError {
  /// The fetch error that caused the cache to be consulted.
  pub fn fetch_error(&self) -> &FetchError {
    match self {
      CacheError::Unavailable { source, .. } | CacheError::Expired { source, .. } => source,
    }
  }
}

/// Failure of a local write on an entity service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
  /// The entity only accepts creations confirmed by the remote store.
  #[error("{entity} can only be created while the remote store is reachable")]
  Offline { entity: String },

  #[error("{entity} record {id} not found")]
  NotFound { entity: String, id: String },

  #[error("invalid patch for {entity} record {id}: {message}")]
  InvalidPatch {
    entity: String,
    id: String,
    message: String,
  },

  #[error("invalid {entity} record: {message}")]
  InvalidRecord { entity: String, message: String },

  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Store(#[from] StoreError),
}
