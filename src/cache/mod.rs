//! Versioned response stores.
//!
//! A backend holds named stores, one per deployed version. Each store maps a
//! request identity (method + URL) to a response snapshot:
//! - Entries are written opportunistically and never expire on their own
//! - Only GET requests are stored or matched
//! - Deleting a store drops every entry it holds

mod memory;
mod storage;
mod traits;

pub use memory::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedEntry, RequestKey};
