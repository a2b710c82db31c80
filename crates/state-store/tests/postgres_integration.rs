//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p state-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use state_store::{KeyValueStore, KeyValueStoreExt, PostgresKeyValueStore, ScanCursor};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_kv_entries.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresKeyValueStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE kv_entries")
        .execute(&pool)
        .await
        .unwrap();

    PostgresKeyValueStore::new(pool)
}

#[tokio::test]
async fn test_set_get_and_overwrite() {
    let store = get_test_store().await;

    store.set("saga:a", "{\"v\":1}".to_string(), None).await.unwrap();
    store.set("saga:a", "{\"v\":2}".to_string(), None).await.unwrap();

    assert_eq!(
        store.get("saga:a").await.unwrap().as_deref(),
        Some("{\"v\":2}")
    );
    assert_eq!(store.get("saga:missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_expired_entry_is_invisible_and_purged() {
    let store = get_test_store().await;

    store
        .set("saga:short", "x".to_string(), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    store.set("saga:long", "y".to_string(), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!store.exists("saga:short").await.unwrap());
    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert!(store.exists("saga:long").await.unwrap());
}

#[tokio::test]
async fn test_delete_returns_whether_entry_existed() {
    let store = get_test_store().await;
    store.set("saga:d", "x".to_string(), None).await.unwrap();

    assert!(store.delete("saga:d").await.unwrap());
    assert!(!store.delete("saga:d").await.unwrap());
}

#[tokio::test]
async fn test_scan_pages_through_prefix() {
    let store = get_test_store().await;
    for i in 0..7 {
        store
            .set(&format!("saga:{i:02}"), i.to_string(), None)
            .await
            .unwrap();
    }
    store.set("lock:01", "z".to_string(), None).await.unwrap();

    let page = store.scan("saga:", ScanCursor::start(), 3).await.unwrap();
    assert_eq!(page.entries.len(), 3);
    assert_eq!(page.entries[0].0, "saga:00");
    assert!(page.next.is_some());

    let all = store.scan_all("saga:", 3).await.unwrap();
    assert_eq!(all.len(), 7);
    assert!(all.iter().all(|(k, _)| k.starts_with("saga:")));
}

#[tokio::test]
async fn test_ping() {
    let store = get_test_store().await;
    store.ping().await.unwrap();
}
