//! Generic offline caching layer.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Persists every successful remote fetch under its [`CacheKey`]
//! - Serves the persisted copy when the remote is unavailable, within a TTL
//! - Drops copies older than their TTL instead of serving them
//! - Tracks an explicit fetch state per key ([`KeyState`])

mod clock;
mod key;
mod layer;
mod state;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::CacheKey;
pub use layer::OfflineCache;
pub use state::{KeyRegistry, KeyState, Ticket};
pub use traits::{CacheEntry, CacheSource, Cacheable, Resolved};
