use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Cacheable;
use crate::error::RemoteError;
use crate::remote::{RemoteDocument, RemoteWrite};

/// Prefix of ids assigned on this device before the remote store has seen
/// the record.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Field under which the record's modification time is sent to the remote
/// store alongside its data.
pub const LAST_MODIFIED_FIELD: &str = "lastModified";

/// Sync lifecycle of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
  /// Holds a local write the remote store has not confirmed yet
  LocalUnsynced,
  /// Matches what the remote store last confirmed
  Synced,
}

/// A cached entity plus the bookkeeping needed to sync it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
  pub id: String,
  pub data: T,
  pub last_modified: DateTime<Utc>,
  pub synced: bool,
}

impl<T: Cacheable> Record<T> {
  /// A record created on this device that the remote store has not seen.
  pub fn provisional(data: T, now: DateTime<Utc>) -> Self {
    Self {
      id: format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4()),
      data,
      last_modified: now,
      synced: false,
    }
  }

  /// A record whose creation the remote store confirmed under `id`.
  pub fn confirmed(id: String, data: T, now: DateTime<Utc>) -> Self {
    Self {
      id,
      data,
      last_modified: now,
      synced: true,
    }
  }

  /// Decode a remote document. Documents without a modification time sort
  /// before every local write.
  pub fn from_remote(doc: RemoteDocument) -> Result<Self, RemoteError> {
    let last_modified = doc.modified_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let mut fields = doc.data;
    if let Value::Object(map) = &mut fields {
      map.remove(LAST_MODIFIED_FIELD);
    }
    let data = serde_json::from_value(fields)
      .map_err(|e| RemoteError::Malformed(format!("document {}: {}", doc.id, e)))?;
    Ok(Self {
      id: doc.id,
      data,
      last_modified,
      synced: true,
    })
  }

  /// Body to send for this record's current state.
  pub fn to_write(&self) -> Result<RemoteWrite, serde_json::Error> {
    let mut data = serde_json::to_value(&self.data)?;
    if let Value::Object(map) = &mut data {
      map.insert(
        LAST_MODIFIED_FIELD.to_string(),
        Value::String(self.last_modified.to_rfc3339()),
      );
    }
    Ok(RemoteWrite {
      data,
      modified_at: self.last_modified,
    })
  }

  /// Shallow-merge the fields of `patch` into the record's data, stamp it and
  /// mark it unsynced.
  ///
  /// The new `last_modified` is strictly later than the previous one even if
  /// the clock has not moved. Leaves the record untouched if the patch is not
  /// an object or the merged value no longer decodes as `T`.
  pub fn apply_patch(&mut self, patch: &Value, now: DateTime<Utc>) -> Result<(), String> {
    let Value::Object(changes) = patch else {
      return Err("patch must be a JSON object".to_string());
    };
    let mut merged = serde_json::to_value(&self.data).map_err(|e| e.to_string())?;
    let Value::Object(fields) = &mut merged else {
      return Err("record data is not an object".to_string());
    };
    for (name, value) in changes {
      fields.insert(name.clone(), value.clone());
    }
    self.data = serde_json::from_value(merged).map_err(|e| e.to_string())?;
    self.last_modified = now.max(self.last_modified + Duration::milliseconds(1));
    self.synced = false;
    Ok(())
  }
}

impl<T> Record<T> {
  pub fn is_provisional(&self) -> bool {
    self.id.starts_with(PROVISIONAL_PREFIX)
  }

  pub fn state(&self) -> RecordState {
    if self.synced {
      RecordState::Synced
    } else {
      RecordState::LocalUnsynced
    }
  }
}

/// Writes not yet confirmed by the remote store.
///
/// Persisted in its own slot next to the collection so an expired or cleared
/// collection entry never takes pending work with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbox<T> {
  pub pending: Vec<Record<T>>,
  pub deletes: Vec<String>,
}

impl<T> Default for Outbox<T> {
  fn default() -> Self {
    Self {
      pending: Vec::new(),
      deletes: Vec::new(),
    }
  }
}

impl<T> Outbox<T> {
  pub fn is_empty(&self) -> bool {
    self.pending.is_empty() && self.deletes.is_empty()
  }
}
