//! SQLite implementation of [`KvBackend`].

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::backend::{Batch, BatchOp, KvBackend};
use crate::error::StoreError;

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    checksum TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed durable storage.
///
/// Each value is stored with a SHA-256 checksum so damaged rows are reported
/// as [`StoreError::Corrupt`] rather than handed to the deserializer.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Backend(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Backend(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("terrasync").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| StoreError::Backend(format!("Failed to run cache migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

fn checksum(value: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(value);
  hex::encode(hasher.finalize())
}

impl KvBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let conn = self.conn()?;
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT value, checksum FROM kv_store WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((value, stored)) => {
        if checksum(&value) != stored {
          return Err(StoreError::Corrupt {
            key: key.to_string(),
            message: "checksum mismatch".to_string(),
          });
        }
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn apply(&self, batch: &Batch) -> Result<(), StoreError> {
    if batch.is_empty() {
      return Ok(());
    }

    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    for op in batch.ops() {
      match op {
        BatchOp::Put { key, value } => {
          tx.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, checksum, updated_at)
             VALUES (?, ?, ?, datetime('now'))",
            params![key, value, checksum(value)],
          )?;
        }
        BatchOp::Remove { key } => {
          tx.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        }
      }
    }
    // Dropping the transaction without commit rolls every op back
    tx.commit()?;
    debug!(ops = batch.ops().len(), "committed store batch");
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn clear(&self) -> Result<(), StoreError> {
    self.conn()?.execute("DELETE FROM kv_store", [])?;
    Ok(())
  }
}
