//! Byte-level key-value backend contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::StoreError;

/// One operation of an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
  Put { key: String, value: Vec<u8> },
  Remove { key: String },
}

/// A group of writes applied all-or-nothing by a [`KvBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
  ops: Vec<BatchOp>,
}

impl Batch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
    self.ops.push(BatchOp::Put {
      key: key.into(),
      value,
    });
    self
  }

  pub fn remove(&mut self, key: impl Into<String>) -> &mut Self {
    self.ops.push(BatchOp::Remove { key: key.into() });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  pub fn ops(&self) -> &[BatchOp] {
    &self.ops
  }
}

/// Durable key to bytes storage.
///
/// Implementations must apply a [`Batch`] atomically: after `apply` returns,
/// either every operation is visible or none is.
pub trait KvBackend: Send + Sync {
  /// Read the bytes stored under `key`.
  ///
  /// Returns [`StoreError::Corrupt`] when the backend can tell the stored
  /// bytes were damaged.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

  /// Apply every operation in `batch` atomically.
  fn apply(&self, batch: &Batch) -> Result<(), StoreError>;

  /// All keys currently holding a value, sorted.
  fn keys(&self) -> Result<Vec<String>, StoreError>;

  /// Remove every key.
  fn clear(&self) -> Result<(), StoreError>;

  fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
    let mut batch = Batch::new();
    batch.put(key, value);
    self.apply(&batch)
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    let mut batch = Batch::new();
    batch.remove(key);
    self.apply(&batch)
  }
}

/// Backend that keeps everything in process memory.
///
/// Nothing survives a restart; used for tests and for running without a disk.
#[derive(Debug, Default)]
pub struct MemoryBackend {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
    self
      .entries
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl KvBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(self.entries()?.get(key).cloned())
  }

  fn apply(&self, batch: &Batch) -> Result<(), StoreError> {
    let mut entries = self.entries()?;
    for op in batch.ops() {
      match op {
        BatchOp::Put { key, value } => {
          entries.insert(key.clone(), value.clone());
        }
        BatchOp::Remove { key } => {
          entries.remove(key);
        }
      }
    }
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.entries()?.keys().cloned().collect())
  }

  fn clear(&self) -> Result<(), StoreError> {
    self.entries()?.clear();
    Ok(())
  }
}
