use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Position in a prefix scan.
///
/// Scans are keyset-paginated: a cursor remembers the last key returned,
/// so pages stay stable while other writers insert or remove keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor(Option<String>);

impl ScanCursor {
    /// Cursor positioned before the first key.
    pub fn start() -> Self {
        Self(None)
    }

    /// Cursor positioned after `key`.
    pub fn after(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    /// Returns the last key already returned, if any.
    pub fn last_key(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Live `(key, value)` pairs in ascending key order.
    pub entries: Vec<(String, String)>,
    /// Cursor for the following page, `None` when the scan is exhausted.
    pub next: Option<ScanCursor>,
}

/// Core trait for key-value store implementations.
///
/// Expired entries are invisible to every read operation even before
/// the backend physically removes them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Inserts or replaces the value under `key`.
    ///
    /// `ttl = None` stores the entry without expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Removes `key`, returning whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Returns up to `count` live entries whose key starts with `prefix`,
    /// starting after `cursor`.
    async fn scan(&self, prefix: &str, cursor: ScanCursor, count: usize) -> Result<ScanPage>;

    /// Physically removes expired entries, returning how many were dropped.
    async fn purge_expired(&self) -> Result<u64>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Extension trait providing convenience methods for key-value stores.
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Checks whether a live entry exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Walks every page of a prefix scan and collects the results.
    async fn scan_all(&self, prefix: &str, page_size: usize) -> Result<Vec<(String, String)>> {
        let mut cursor = ScanCursor::start();
        let mut all = Vec::new();
        loop {
            let page = self.scan(prefix, cursor, page_size).await?;
            all.extend(page.entries);
            match page.next {
                Some(next) => cursor = next,
                None => return Ok(all),
            }
        }
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}
