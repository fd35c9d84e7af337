//! Typed access to a [`KvBackend`].

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::backend::{Batch, KvBackend};
use crate::cache::CacheKey;
use crate::error::StoreError;

/// Serializes values to JSON on top of a byte backend.
///
/// Reads never fail: a damaged or undecodable value is logged, removed, and
/// reported as absent.
#[derive(Clone)]
pub struct LocalStore {
  backend: Arc<dyn KvBackend>,
}

impl LocalStore {
  pub fn new(backend: Arc<dyn KvBackend>) -> Self {
    Self { backend }
  }

  /// Read and decode the value stored under `key`.
  pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let bytes = match self.backend.get(key.as_str()) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(err @ StoreError::Corrupt { .. }) => {
        warn!(key = %key, error = %err, "dropping corrupt cache entry");
        self.discard(key);
        return None;
      }
      Err(err) => {
        warn!(key = %key, error = %err, "cache read failed, treating as miss");
        return None;
      }
    };

    match serde_json::from_slice(&bytes) {
      Ok(value) => Some(value),
      Err(err) => {
        warn!(key = %key, error = %err, "undecodable cache entry, clearing");
        self.discard(key);
        None
      }
    }
  }

  /// Replace the value stored under `key`.
  pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), StoreError> {
    let mut batch = Batch::new();
    self.stage(&mut batch, key, value)?;
    self.commit(&batch)
  }

  /// Encode `value` and add it to `batch` under `key`.
  pub fn stage<T: Serialize>(
    &self,
    batch: &mut Batch,
    key: &CacheKey,
    value: &T,
  ) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialize {
      key: key.to_string(),
      message: e.to_string(),
    })?;
    batch.put(key.as_str(), bytes);
    Ok(())
  }

  pub fn commit(&self, batch: &Batch) -> Result<(), StoreError> {
    self.backend.apply(batch)
  }

  pub fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
    self.backend.remove(key.as_str())
  }

  /// Raw bytes under `key`, without decoding.
  pub fn raw(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
    self.backend.get(key.as_str())
  }

  pub fn keys(&self) -> Result<Vec<CacheKey>, StoreError> {
    Ok(
      self
        .backend
        .keys()?
        .into_iter()
        .map(CacheKey::from)
        .collect(),
    )
  }

  pub fn clear(&self) -> Result<(), StoreError> {
    self.backend.clear()
  }

  fn discard(&self, key: &CacheKey) {
    if let Err(err) = self.backend.remove(key.as_str()) {
      warn!(key = %key, error = %err, "failed to clear corrupt cache entry");
    }
  }
}
