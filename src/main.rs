use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use terrasync::bus::MutationBus;
use terrasync::cache::{CacheKey, OfflineCache, SystemClock};
use terrasync::config::Config;
use terrasync::store::{LocalStore, SqliteBackend};
use terrasync::sync::Outbox;

#[derive(Parser, Debug)]
#[command(name = "terrasync")]
#[command(about = "Inspect and maintain the terrasync offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/terrasync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List cached keys
  Keys,
  /// Print the cached entry for a key
  Show { key: String },
  /// Remove one cached key
  Clear { key: String },
  /// Remove every cached key
  ClearAll,
  /// Show age, TTL state and pending writes for every key
  Status,
}

/// Install the global subscriber. The returned guard flushes the log file
/// when dropped.
fn init_tracing(config: &Config, verbose: bool) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match config.log_dir() {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "terrasync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).boxed());

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .init();
  guard
}

fn open_cache(config: &Config) -> Result<OfflineCache> {
  let path = config
    .database_path()
    .ok_or_else(|| eyre!("Could not determine cache database path; set `database` in the config"))?;
  let backend = SqliteBackend::open(&path)?;
  info!(path = %path.display(), "opened offline cache");
  Ok(OfflineCache::new(
    LocalStore::new(Arc::new(backend)),
    MutationBus::new(),
    Arc::new(SystemClock),
  ))
}

fn status(cache: &OfflineCache, config: &Config) -> Result<()> {
  let now = cache.now();
  let ttl = config.default_ttl()?;
  for key in cache.store().keys()? {
    if key.is_outbox() {
      let outbox: Outbox<serde_json::Value> = cache.store().get(&key).unwrap_or_default();
      println!(
        "{:<32} {} pending, {} deletes",
        key.as_str(),
        outbox.pending.len(),
        outbox.deletes.len()
      );
      continue;
    }
    match cache.peek::<serde_json::Value>(&key) {
      Some(entry) => {
        let age = entry.age(now);
        let state = if entry.is_within(ttl, now) {
          "fresh"
        } else {
          "expired"
        };
        println!(
          "{:<32} {:>8}s old  {}",
          key.as_str(),
          age.num_seconds(),
          state
        );
      }
      None => println!("{:<32} unreadable", key.as_str()),
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config, args.verbose);

  let cache = open_cache(&config)?;

  match args.command {
    Command::Keys => {
      for key in cache.store().keys()? {
        println!("{}", key);
      }
    }
    Command::Show { key } => {
      let key = CacheKey::new(key);
      let bytes = cache
        .store()
        .raw(&key)?
        .ok_or_else(|| eyre!("No cached entry for {}", key))?;
      let value: serde_json::Value = serde_json::from_slice(&bytes)?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Clear { key } => {
      let key = CacheKey::new(key);
      cache.clear(&key)?;
      println!("Cleared {}", key);
    }
    Command::ClearAll => {
      let cleared = cache.clear_all()?;
      println!("Cleared {} keys", cleared.len());
    }
    Command::Status => status(&cache, &config)?,
  }

  Ok(())
}
