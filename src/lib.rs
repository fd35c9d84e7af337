//! Offline-first cache and sync layer.
//!
//! - [`store`]: durable key-value storage (SQLite or in-memory)
//! - [`cache`]: TTL-bounded fallback reads over remote fetches
//! - [`bus`]: per-key change notifications
//! - [`sync`]: local-first writes and reconciliation per entity collection
//! - [`live`]: server-pushed snapshots written through to the cache
//! - [`context`]: the application-wide wiring of all of the above

pub mod bus;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod live;
pub mod remote;
pub mod store;
pub mod sync;

pub use bus::{MutationBus, Subscription};
pub use cache::{CacheEntry, CacheKey, CacheSource, KeyState, OfflineCache, Resolved};
pub use context::AppContext;
pub use error::{CacheError, FetchError, RemoteError, StoreError, WriteError};
pub use live::{LiveBridge, SnapshotSink};
pub use remote::{MemoryRemote, RemoteDocument, RemoteStore};
pub use sync::{CreatePolicy, EntityConfig, EntitySyncService, Record, SyncResult};
