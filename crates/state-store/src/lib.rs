//! Durable key-value storage used to persist saga state.
//!
//! Entries carry an optional TTL and can be listed by key prefix with
//! cursor pagination, so callers never need a single unbounded listing.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryKeyValueStore;
pub use postgres::PostgresKeyValueStore;
pub use store::{KeyValueStore, KeyValueStoreExt, ScanCursor, ScanPage};
