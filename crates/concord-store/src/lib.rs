//! # Concord Store
//!
//! Storage for room events, the state after each event, and the chain
//! cover index over the auth DAG.
//!
//! ## Overview
//!
//! The event handler and the state resolver reach storage only through the
//! [`EventStore`] trait. The primary implementation is [`SqliteStore`], with
//! [`MemoryStore`] for tests. [`CachedStore`] puts an LRU [`EventCache`] in
//! front of either.
//!
//! ## Key Types
//!
//! - [`EventStore`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`ChainIndex`] / [`LinkMap`] - The chain cover index
//! - [`StateGroup`] - The state after an event, stored as a delta
//!
//! ## Usage
//!
//! ```rust,no_run
//! use concord_store::{EventStore, SqliteStore};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("concord.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     // let result = store.insert_event(&event, &EventMetadata::default()).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent inserts**: Inserting the same event twice returns `AlreadyExists`
//!   and leaves the first metadata in place
//! - **Bounded state lookups**: delta chains are cut by a full snapshot every
//!   [`MAX_DELTA_HOPS`] groups
//! - **Chain cover fallback**: [`auth_chain_difference`] walks the graph when
//!   the index does not cover every event involved

pub mod auth_chain;
pub mod cache;
pub mod chain;
pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod state_group;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_utils;

pub use auth_chain::{auth_chain_difference, auth_chain_difference_by_walking, get_auth_chain_ids};
pub use cache::{CachedStore, EventCache, DEFAULT_EVENT_CACHE_CAPACITY};
pub use chain::{ChainIndex, ChainLink, ChainPosition, LinkMap};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, StoreConfig};
pub use state_group::{StateGroup, MAX_DELTA_HOPS};
pub use traits::{EventMap, EventStore, InsertResult};
