use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{
    Result, StoreError,
    store::{KeyValueStore, ScanCursor, ScanPage},
};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory key-value store.
///
/// Provides the same contract as the PostgreSQL implementation. Expiry is
/// measured on the tokio clock so tests can advance time deterministically.
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryKeyValueStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the number of entries held, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if the store holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Returns the remaining TTL of a live entry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let expires_at = match ttl {
            Some(ttl) => Some(
                Instant::now()
                    .checked_add(ttl)
                    .ok_or_else(|| StoreError::InvalidTtl(format!("{ttl:?} overflows")))?,
            ),
            None => None,
        };
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn scan(&self, prefix: &str, cursor: ScanCursor, count: usize) -> Result<ScanPage> {
        self.check_available()?;
        let count = count.max(1);
        let now = Instant::now();
        let entries = self.entries.read().await;

        let lower = match cursor.last_key() {
            Some(last) if last >= prefix => Bound::Excluded(last.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };

        let mut page: Vec<(String, String)> = entries
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .take(count + 1)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();

        let next = if page.len() > count {
            page.truncate(count);
            page.last().map(|(k, _)| ScanCursor::after(k.clone()))
        } else {
            None
        };

        Ok(ScanPage {
            entries: page,
            next,
        })
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyValueStoreExt;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryKeyValueStore::new();
        store.set("saga:1", "one".to_string(), None).await.unwrap();

        assert_eq!(store.get("saga:1").await.unwrap().as_deref(), Some("one"));
        assert_eq!(store.get("saga:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "a".to_string(), None).await.unwrap();
        store.set("k", "b".to_string(), None).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_invisible() {
        let store = InMemoryKeyValueStore::new();
        store
            .set("k", "v".to_string(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.ttl("k").await, Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_removes_only_dead_entries() {
        let store = InMemoryKeyValueStore::new();
        store
            .set("short", "v".to_string(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("forever", "v".to_string(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.exists("forever").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_paginates_within_prefix() {
        let store = InMemoryKeyValueStore::new();
        for i in 0..5 {
            store
                .set(&format!("saga:{i}"), i.to_string(), None)
                .await
                .unwrap();
        }
        store.set("other:1", "x".to_string(), None).await.unwrap();
        store.set("sagb:1", "x".to_string(), None).await.unwrap();

        let first = store.scan("saga:", ScanCursor::start(), 2).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.entries[0].0, "saga:0");
        let cursor = first.next.expect("more pages");

        let second = store.scan("saga:", cursor, 2).await.unwrap();
        assert_eq!(second.entries[0].0, "saga:2");

        let third = store.scan("saga:", second.next.unwrap(), 2).await.unwrap();
        assert_eq!(third.entries.len(), 1);
        assert_eq!(third.entries[0].0, "saga:4");
        assert!(third.next.is_none());
    }

    #[tokio::test]
    async fn test_scan_all_collects_every_page() {
        let store = InMemoryKeyValueStore::new();
        for i in 0..250 {
            store
                .set(&format!("saga:{i:04}"), i.to_string(), None)
                .await
                .unwrap();
        }

        let all = store.scan_all("saga:", 100).await.unwrap();
        assert_eq!(all.len(), 250);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn test_scan_tolerates_deleted_cursor_key() {
        let store = InMemoryKeyValueStore::new();
        for key in ["p:a", "p:b", "p:c"] {
            store.set(key, "v".to_string(), None).await.unwrap();
        }

        let first = store.scan("p:", ScanCursor::start(), 1).await.unwrap();
        store.delete("p:a").await.unwrap();
        let second = store.scan("p:", first.next.unwrap(), 5).await.unwrap();

        let keys: Vec<_> = second.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p:b", "p:c"]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryKeyValueStore::new();
        store.set_unavailable(true);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.ping().await.is_err());

        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
