//! Generic entity sync.
//!
//! One [`EntitySyncService`] per collection, configured by an
//! [`EntityConfig`]: local-first writes, background remote propagation, and a
//! reconciliation pass ([`EntitySyncService::sync_all`]) that pushes pending
//! writes and pulls the authoritative collection.

mod config;
mod lifecycle;
mod locks;
mod reconcile;
mod record;
mod service;

pub use config::{CreatePolicy, EntityConfig, DEFAULT_TTL_HOURS};
pub use lifecycle::SyncLifecycle;
pub use locks::KeyedLocks;
pub use reconcile::reconcile;
pub use record::{Outbox, Record, RecordState, LAST_MODIFIED_FIELD, PROVISIONAL_PREFIX};
pub use service::{EntitySyncService, SyncReport, SyncResult};
