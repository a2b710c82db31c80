//! Periodic removal of expired store entries.

use std::time::Duration;

use state_store::KeyValueStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Purges expired entries every `interval` until `shutdown` flips to true.
///
/// Backends that evict on their own report zero purged entries.
pub async fn run<S: KeyValueStore>(store: S, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "expired entries purged"),
                    Err(e) => tracing::warn!(error = %e, "store purge failed"),
                }
            }
        }
    }

    tracing::info!("store janitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_store::{InMemoryKeyValueStore, KeyValueStoreExt};

    #[tokio::test(start_paused = true)]
    async fn test_purges_expired_entries_until_shutdown() {
        let store = InMemoryKeyValueStore::new();
        store
            .set("saga:old", "{}".to_string(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("saga:kept", "{}".to_string(), None).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(store.clone(), Duration::from_secs(5), rx));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.len().await, 1);
        assert!(store.exists("saga:kept").await.unwrap());

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
