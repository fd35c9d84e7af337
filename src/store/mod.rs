//! Durable local storage for cached collections.
//!
//! - [`KvBackend`] is the byte-level collaborator contract (get/set/remove)
//! - [`SqliteBackend`] persists across restarts, [`MemoryBackend`] does not
//! - [`LocalStore`] adds JSON encoding and corruption-as-miss semantics

mod backend;
mod local;
mod sqlite;

pub use backend::{Batch, BatchOp, KvBackend, MemoryBackend};
pub use local::LocalStore;
pub use sqlite::SqliteBackend;
