use chrono::Duration;

use crate::cache::CacheKey;
use crate::config::EntitySettings;

/// Default TTL for cached entity collections.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// How `create` behaves when the remote store cannot confirm the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
  /// Accept the record locally under a provisional id and push it later
  #[default]
  Optimistic,
  /// Refuse the create unless the remote store confirms it
  RequireRemote,
}

/// Per-entity configuration for [`super::EntitySyncService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
  /// Name used in logs, errors and config overrides
  pub name: String,
  /// Local store slot of the collection
  pub key: CacheKey,
  /// Remote collection path
  pub path: String,
  pub create_policy: CreatePolicy,
  /// Maximum age of the cached collection served when the remote is down
  pub ttl: Duration,
  /// Invalidate every subscribed key under this prefix instead of only `key`
  pub invalidate_prefix: Option<String>,
}

impl EntityConfig {
  pub fn new(name: &str, path: &str) -> Self {
    Self {
      name: name.to_string(),
      key: CacheKey::new(name),
      path: path.to_string(),
      create_policy: CreatePolicy::default(),
      ttl: Duration::hours(DEFAULT_TTL_HOURS),
      invalidate_prefix: None,
    }
  }

  /// Configuration for the records under one parent, each parent getting its
  /// own cache slot and remote path.
  pub fn scoped(name: &str, path: &str, parent: &str) -> Self {
    Self {
      key: CacheKey::scoped(name, parent),
      path: format!("{}/{}", path, parent),
      ..Self::new(name, path)
    }
  }

  pub fn with_create_policy(mut self, policy: CreatePolicy) -> Self {
    self.create_policy = policy;
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_invalidate_prefix(mut self, prefix: &str) -> Self {
    self.invalidate_prefix = Some(prefix.to_string());
    self
  }

  /// Apply overrides from the config file.
  pub fn with_settings(mut self, settings: &EntitySettings) -> Self {
    if let Some(ttl) = settings.ttl() {
      self.ttl = ttl;
    }
    if let Some(require) = settings.require_remote_create {
      self.create_policy = if require {
        CreatePolicy::RequireRemote
      } else {
        CreatePolicy::Optimistic
      };
    }
    self
  }

  // ===== Presets =====

  pub fn territories() -> Self {
    Self::new("territories", "territories")
  }

  /// Groups can only be created online.
  pub fn groups() -> Self {
    Self::new("groups", "groups").with_create_policy(CreatePolicy::RequireRemote)
  }

  /// Houses to avoid inside one territory. A change to any territory's
  /// houses invalidates every house list.
  pub fn houses(territory_id: &str) -> Self {
    Self::scoped("houses", "avoidHouses", territory_id).with_invalidate_prefix("houses/")
  }

  pub fn users() -> Self {
    Self::new("users", "users")
  }
}
