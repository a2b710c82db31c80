use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::{
    Result, StoreError,
    store::{KeyValueStore, ScanCursor, ScanPage},
};

/// PostgreSQL-backed key-value store.
///
/// Entries live in `kv_entries`; expiry is evaluated against the database
/// clock and rows are reaped by [`KeyValueStore::purge_expired`].
#[derive(Clone)]
pub struct PostgresKeyValueStore {
    pool: PgPool,
}

impl PostgresKeyValueStore {
    /// Creates a new PostgreSQL key-value store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn expiry(ttl: Option<Duration>) -> Result<Option<DateTime<Utc>>> {
        ttl.map(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .ok_or_else(|| StoreError::InvalidTtl(format!("{ttl:?} out of range")))
        })
        .transpose()
    }
}

#[async_trait]
impl KeyValueStore for PostgresKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM kv_entries
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = Self::expiry(ttl)?;

        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let live: Option<bool> = sqlx::query_scalar(
            r#"
            DELETE FROM kv_entries WHERE key = $1
            RETURNING (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(live.unwrap_or(false))
    }

    async fn scan(&self, prefix: &str, cursor: ScanCursor, count: usize) -> Result<ScanPage> {
        let count = count.max(1);
        let limit = i64::try_from(count + 1).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT key, value FROM kv_entries
            WHERE left(key, length($1)) = $1
              AND ($2::TEXT IS NULL OR key > $2)
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY key
            LIMIT $3
            "#,
        )
        .bind(prefix)
        .bind(cursor.last_key())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = rows
            .into_iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect::<std::result::Result<Vec<(String, String)>, sqlx::Error>>()?;

        let next = if entries.len() > count {
            entries.truncate(count);
            entries.last().map(|(k, _)| ScanCursor::after(k.clone()))
        } else {
            None
        };

        Ok(ScanPage { entries, next })
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::debug!(purged, "purged expired state store entries");
        }
        Ok(purged)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
