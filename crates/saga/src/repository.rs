//! Persistence of [`SagaState`] in a key-value store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::SagaId;
use state_store::{KeyValueStore, ScanCursor};

use crate::error::{Result, SagaError};
use crate::saga_state::SagaState;
use crate::state::SagaStatus;

/// Prefix of every saga key.
pub const KEY_PREFIX: &str = "saga:";

/// Maps sagas onto `saga:<id>` keys holding JSON.
///
/// Every read goes to the store; nothing is cached in process.
// TODO: add compare-and-swap on `updated_at` once a second consumer group
// may read the same partitions.
#[derive(Clone)]
pub struct SagaRepository<S> {
    store: S,
    retention: Duration,
    page_size: usize,
}

impl<S: KeyValueStore> SagaRepository<S> {
    /// Creates a repository keeping finished or expired sagas for `retention`.
    pub fn new(store: S, retention: Duration, page_size: usize) -> Self {
        Self {
            store,
            retention,
            page_size: page_size.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn key(id: SagaId) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    /// TTL for a saga written at `now`.
    ///
    /// Active sagas live until they expire plus the retention margin, so an
    /// expired saga is still there for the timeout monitor to recover.
    /// Finished or already expired sagas get the retention period alone.
    pub fn ttl_for(&self, saga: &SagaState, now: DateTime<Utc>) -> Duration {
        if saga.is_terminal() {
            return self.retention;
        }
        match (saga.expires_at() - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining.saturating_add(self.retention),
            _ => self.retention,
        }
    }

    /// Inserts or replaces the saga.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id(), status = %saga.status()))]
    pub async fn save(&self, saga: &SagaState) -> Result<()> {
        let json = serde_json::to_string(saga)?;
        let ttl = self.ttl_for(saga, Utc::now());
        self.store.set(&Self::key(saga.id()), json, Some(ttl)).await?;
        Ok(())
    }

    /// Loads the saga or fails with [`SagaError::NotFound`].
    pub async fn get(&self, id: SagaId) -> Result<SagaState> {
        self.find(id).await?.ok_or(SagaError::NotFound(id))
    }

    /// Loads the saga if it exists.
    pub async fn find(&self, id: SagaId) -> Result<Option<SagaState>> {
        match self.store.get(&Self::key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Removes the saga, returning whether it existed.
    pub async fn delete(&self, id: SagaId) -> Result<bool> {
        Ok(self.store.delete(&Self::key(id)).await?)
    }

    /// Active sagas whose `expires_at` lies before `now`.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SagaState>> {
        self.scan_matching(|saga| saga.status().is_active() && saga.is_expired(now))
            .await
    }

    /// Sagas left in `rolling_back` past their `expires_at`.
    ///
    /// A rollback normally finishes within the handler that started it, so
    /// one still open after expiry was interrupted before it could finish.
    pub async fn list_stalled_rollbacks(&self, now: DateTime<Utc>) -> Result<Vec<SagaState>> {
        self.scan_matching(|saga| saga.status() == SagaStatus::RollingBack && saga.is_expired(now))
            .await
    }

    /// Every saga currently in `status`.
    pub async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaState>> {
        self.scan_matching(|saga| saga.status() == status).await
    }

    async fn scan_matching<F>(&self, keep: F) -> Result<Vec<SagaState>>
    where
        F: Fn(&SagaState) -> bool + Send + Sync,
    {
        let mut cursor = ScanCursor::start();
        let mut found = Vec::new();
        loop {
            let page = self.store.scan(KEY_PREFIX, cursor, self.page_size).await?;
            for (key, json) in page.entries {
                match serde_json::from_str::<SagaState>(&json) {
                    Ok(saga) if keep(&saga) => found.push(saga),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(%key, error = %e, "skipping undecodable saga"),
                }
            }
            match page.next {
                Some(next) => cursor = next,
                None => return Ok(found),
            }
        }
    }
}
