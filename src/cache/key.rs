use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix of the slot holding an entity collection's pending writes.
const OUTBOX_SUFFIX: &str = "#outbox";

/// Identifies one logical collection or singleton in the local store.
///
/// Keys map one-to-one onto store slots: `"territories"`, `"user/{uid}"`,
/// `"houses/{territoryId}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  /// Key of a collection scoped under a parent record, e.g. the houses of
  /// one territory.
  pub fn scoped(collection: &str, parent: &str) -> Self {
    Self(format!("{}/{}", collection, parent))
  }

  /// Key of the slot that holds this collection's unconfirmed writes.
  pub fn outbox(&self) -> CacheKey {
    CacheKey(format!("{}{}", self.0, OUTBOX_SUFFIX))
  }

  pub fn is_outbox(&self) -> bool {
    self.0.ends_with(OUTBOX_SUFFIX)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn starts_with(&self, prefix: &str) -> bool {
    self.0.starts_with(prefix)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

impl From<&str> for CacheKey {
  fn from(key: &str) -> Self {
    Self::new(key)
  }
}

impl From<String> for CacheKey {
  fn from(key: String) -> Self {
    Self(key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scoped_key() {
    let key = CacheKey::scoped("houses", "t-42");
    assert_eq!(key.as_str(), "houses/t-42");
    assert!(key.starts_with("houses/"));
  }

  #[test]
  fn test_outbox_key_is_distinct() {
    let key = CacheKey::new("territories");
    let outbox = key.outbox();
    assert_ne!(key, outbox);
    assert!(outbox.is_outbox());
    assert!(!key.is_outbox());
  }
}
