use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::store::SqliteBackend;
use crate::sync::DEFAULT_TTL_HOURS;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// SQLite cache file (defaults to $XDG_DATA_HOME/terrasync/cache.db)
  pub database: Option<PathBuf>,
  /// Default TTL in seconds for cached collections
  pub default_ttl: Option<u64>,
  /// Directory for rolling log files (defaults to the data directory)
  pub log_dir: Option<PathBuf>,
  /// Per-entity overrides keyed by entity name
  #[serde(default)]
  pub entities: HashMap<String, EntitySettings>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EntitySettings {
  /// TTL in seconds for this entity's collections
  #[serde(rename = "ttl")]
  pub ttl_secs: Option<u64>,
  /// Refuse creations the remote store has not confirmed
  pub require_remote_create: Option<bool>,
}

impl EntitySettings {
  pub fn ttl(&self) -> Option<chrono::Duration> {
    self.ttl_secs.and_then(ttl_from_secs)
  }
}

/// TTL for a number of seconds, or `None` if chrono cannot represent it.
pub fn ttl_from_secs(secs: u64) -> Option<chrono::Duration> {
  i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./terrasync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/terrasync/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("terrasync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("terrasync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    let config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config
      .validate()
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
    Ok(config)
  }

  /// Reject settings that cannot be used, such as TTLs too large to
  /// represent.
  pub fn validate(&self) -> Result<()> {
    self.default_ttl()?;
    for (name, settings) in &self.entities {
      if let Some(secs) = settings.ttl_secs {
        if settings.ttl().is_none() {
          return Err(eyre!("ttl for {} is out of range: {}", name, secs));
        }
      }
    }
    Ok(())
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn default_ttl(&self) -> Result<chrono::Duration> {
    match self.default_ttl {
      Some(secs) => ttl_from_secs(secs).ok_or_else(|| eyre!("default_ttl is out of range: {}", secs)),
      None => Ok(chrono::Duration::hours(DEFAULT_TTL_HOURS)),
    }
  }

  /// Path of the SQLite cache, if one can be determined.
  pub fn database_path(&self) -> Option<PathBuf> {
    self
      .database
      .clone()
      .or_else(SqliteBackend::default_path)
  }

  /// Directory for log files, if one can be determined.
  pub fn log_dir(&self) -> Option<PathBuf> {
    self
      .log_dir
      .clone()
      .or_else(|| Some(dirs::data_dir()?.join("terrasync").join("logs")))
  }

  pub fn entity(&self, name: &str) -> Option<&EntitySettings> {
    self.entities.get(name)
  }
}
