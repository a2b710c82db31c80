//! The persisted aggregate of one saga.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::pipeline::Pipeline;
use crate::state::SagaStatus;

pub const META_LAST_ERROR: &str = "last_error";
pub const META_ROLLBACK_REASON: &str = "rollback_reason";
pub const META_TIMED_OUT: &str = "timed_out";
pub const META_COMPENSATION_FAILURES: &str = "compensation_failures";

/// Snapshot of one saga.
///
/// Values are never mutated in place: every transition method returns a
/// new snapshot, or an error if the status machine forbids the change.
/// Terminal snapshots refuse all transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaState {
    id: SagaId,
    user_id: String,
    status: SagaStatus,
    #[serde(default)]
    current_step: Option<String>,
    #[serde(default)]
    failed_step: Option<String>,
    #[serde(default)]
    completed_steps: Vec<String>,
    #[serde(default)]
    retry_count: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl SagaState {
    /// Creates a pending saga that expires `timeout` after `now`.
    pub fn new(user_id: impl Into<String>, timeout: Duration, now: DateTime<Utc>) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            id: SagaId::new(),
            user_id: user_id.into(),
            status: SagaStatus::Pending,
            current_step: None,
            failed_step: None,
            completed_steps: Vec::new(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
            metadata: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// True once `expires_at` lies strictly before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    fn transition(&self, to: SagaStatus, now: DateTime<Utc>) -> Result<Self> {
        if !self.status.can_transition_to(to) {
            return Err(SagaError::InvalidTransition {
                saga_id: self.id,
                from: self.status,
                to,
            });
        }
        let mut next = self.clone();
        next.status = to;
        next.updated_at = now;
        Ok(next)
    }

    fn require_status(&self, expected: SagaStatus, to: SagaStatus) -> Result<()> {
        if self.status != expected {
            return Err(SagaError::InvalidTransition {
                saga_id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Marks `step` as the step currently awaiting a result.
    pub fn begin_step(&self, step: &str, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.transition(SagaStatus::InProgress, now)?;
        next.current_step = Some(step.to_string());
        Ok(next)
    }

    /// Records `step` as completed.
    ///
    /// The list stays in pipeline order regardless of the order results
    /// arrive in; an already recorded step is left as is.
    pub fn record_step_completed(
        &self,
        step: &str,
        pipeline: &Pipeline,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        self.require_status(SagaStatus::InProgress, SagaStatus::InProgress)?;
        let position = pipeline
            .position(step)
            .ok_or_else(|| SagaError::UnknownStep(step.to_string()))?;

        let mut next = self.transition(SagaStatus::InProgress, now)?;
        if !next.is_step_completed(step) {
            let at = next
                .completed_steps
                .iter()
                .position(|done| pipeline.position(done).is_none_or(|p| p > position))
                .unwrap_or(next.completed_steps.len());
            next.completed_steps.insert(at, step.to_string());
        }
        Ok(next)
    }

    /// Records a failed attempt of `step` and bumps the retry counter.
    pub fn record_step_failure(
        &self,
        step: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        self.require_status(SagaStatus::InProgress, SagaStatus::InProgress)?;
        let mut next = self.transition(SagaStatus::InProgress, now)?;
        next.failed_step = Some(step.to_string());
        next.retry_count = next.retry_count.saturating_add(1);
        if let Some(reason) = reason {
            next.metadata
                .insert(META_LAST_ERROR.to_string(), reason.to_string());
        }
        Ok(next)
    }

    /// Moves the saga into compensation.
    pub fn begin_compensation(&self, reason: &str, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.transition(SagaStatus::RollingBack, now)?;
        next.current_step = None;
        next.metadata
            .entry(META_ROLLBACK_REASON.to_string())
            .or_insert_with(|| reason.to_string());
        Ok(next)
    }

    /// Marks the saga as abandoned by the timeout monitor.
    pub fn mark_timed_out(&self, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.begin_compensation("timeout", now)?;
        next.metadata
            .insert(META_TIMED_OUT.to_string(), "true".to_string());
        Ok(next)
    }

    /// Re-enters an interrupted compensation, keeping the original reason.
    pub fn resume_compensation(&self, now: DateTime<Utc>) -> Result<Self> {
        self.require_status(SagaStatus::RollingBack, SagaStatus::RollingBack)?;
        self.begin_compensation("resumed", now)
    }

    /// Finalizes a saga whose every step succeeded.
    pub fn complete(&self, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.transition(SagaStatus::Completed, now)?;
        next.current_step = None;
        Ok(next)
    }

    /// Finalizes compensation, noting the steps whose compensation could
    /// not be published.
    pub fn finish_rollback(&self, failed_compensations: &[String], now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.transition(SagaStatus::RolledBack, now)?;
        if !failed_compensations.is_empty() {
            next.metadata.insert(
                META_COMPENSATION_FAILURES.to_string(),
                failed_compensations.join(","),
            );
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        STEP_DELETE_AUTH_USER, STEP_DELETE_BOARD_USER, STEP_DELETE_TASK_USER,
        STEP_DELETE_TEAM_USER,
    };

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn in_progress() -> SagaState {
        SagaState::new("u1", Duration::from_secs(60), now())
            .begin_step(STEP_DELETE_AUTH_USER, now())
            .unwrap()
    }

    #[test]
    fn test_new_saga_is_pending_with_fixed_expiry() {
        let created = now();
        let saga = SagaState::new("u1", Duration::from_secs(300), created);

        assert_eq!(saga.status(), SagaStatus::Pending);
        assert_eq!(saga.user_id(), "u1");
        assert_eq!(saga.expires_at() - saga.created_at(), chrono::Duration::seconds(300));
        assert!(saga.completed_steps().is_empty());
        assert_eq!(saga.retry_count(), 0);
    }

    #[test]
    fn test_transitions_return_new_values() {
        let pending = SagaState::new("u1", Duration::from_secs(60), now());
        let started = pending.begin_step(STEP_DELETE_AUTH_USER, now()).unwrap();

        assert_eq!(pending.status(), SagaStatus::Pending);
        assert_eq!(started.status(), SagaStatus::InProgress);
        assert_eq!(started.current_step(), Some(STEP_DELETE_AUTH_USER));
        assert_eq!(started.id(), pending.id());
    }

    #[test]
    fn test_completed_steps_have_no_duplicates() {
        let pipeline = Pipeline::default();
        let saga = in_progress()
            .record_step_completed(STEP_DELETE_AUTH_USER, &pipeline, now())
            .unwrap()
            .record_step_completed(STEP_DELETE_AUTH_USER, &pipeline, now())
            .unwrap();

        assert_eq!(saga.completed_steps(), &[STEP_DELETE_AUTH_USER.to_string()]);
    }

    #[test]
    fn test_completed_steps_keep_pipeline_order() {
        let pipeline = Pipeline::default();
        let mut saga = in_progress();
        for step in [
            STEP_DELETE_TASK_USER,
            STEP_DELETE_BOARD_USER,
            STEP_DELETE_TEAM_USER,
            STEP_DELETE_AUTH_USER,
        ] {
            saga = saga.record_step_completed(step, &pipeline, now()).unwrap();
        }

        let expected: Vec<String> = pipeline.steps().iter().map(|s| s.name.clone()).collect();
        assert_eq!(saga.completed_steps(), expected.as_slice());
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let err = in_progress()
            .record_step_completed("delete_wiki_user", &Pipeline::default(), now())
            .unwrap_err();
        assert!(matches!(err, SagaError::UnknownStep(_)));
    }

    #[test]
    fn test_failure_counts_retries_and_keeps_reason() {
        let saga = in_progress()
            .record_step_failure(STEP_DELETE_AUTH_USER, Some("db down"), now())
            .unwrap()
            .record_step_failure(STEP_DELETE_AUTH_USER, None, now())
            .unwrap();

        assert_eq!(saga.retry_count(), 2);
        assert_eq!(saga.failed_step(), Some(STEP_DELETE_AUTH_USER));
        assert_eq!(saga.metadata().get(META_LAST_ERROR).unwrap(), "db down");
    }

    #[test]
    fn test_results_are_refused_outside_in_progress() {
        let pipeline = Pipeline::default();
        let pending = SagaState::new("u1", Duration::from_secs(60), now());
        assert!(
            pending
                .record_step_completed(STEP_DELETE_AUTH_USER, &pipeline, now())
                .is_err()
        );

        let rolling = in_progress().begin_compensation("failure", now()).unwrap();
        assert!(rolling.record_step_failure(STEP_DELETE_AUTH_USER, None, now()).is_err());
    }

    #[test]
    fn test_terminal_sagas_refuse_every_transition() {
        let pipeline = Pipeline::default();
        let completed = in_progress().complete(now()).unwrap();
        let rolled_back = in_progress()
            .begin_compensation("failure", now())
            .unwrap()
            .finish_rollback(&[], now())
            .unwrap();

        for saga in [completed, rolled_back] {
            assert!(saga.is_terminal());
            assert!(saga.begin_step(STEP_DELETE_AUTH_USER, now()).is_err());
            assert!(
                saga.record_step_completed(STEP_DELETE_AUTH_USER, &pipeline, now())
                    .is_err()
            );
            assert!(saga.begin_compensation("late", now()).is_err());
            assert!(saga.complete(now()).is_err());
            assert!(saga.finish_rollback(&[], now()).is_err());
        }
    }

    #[test]
    fn test_timeout_marks_metadata_and_keeps_first_reason() {
        let pending = SagaState::new("u1", Duration::from_secs(60), now());
        let timed_out = pending.mark_timed_out(now()).unwrap();

        assert_eq!(timed_out.status(), SagaStatus::RollingBack);
        assert_eq!(timed_out.metadata().get(META_TIMED_OUT).unwrap(), "true");
        assert_eq!(timed_out.metadata().get(META_ROLLBACK_REASON).unwrap(), "timeout");

        let again = timed_out.begin_compensation("other", now()).unwrap();
        assert_eq!(again.metadata().get(META_ROLLBACK_REASON).unwrap(), "timeout");
    }

    #[test]
    fn test_resume_compensation_only_from_rolling_back() {
        assert!(in_progress().resume_compensation(now()).is_err());

        let rolling = in_progress().begin_compensation("team failed", now()).unwrap();
        let resumed = rolling.resume_compensation(now()).unwrap();
        assert_eq!(resumed.status(), SagaStatus::RollingBack);
        assert_eq!(
            resumed.metadata().get(META_ROLLBACK_REASON).unwrap(),
            "team failed"
        );
    }

    #[test]
    fn test_finish_rollback_records_failures() {
        let saga = in_progress()
            .begin_compensation("failure", now())
            .unwrap()
            .finish_rollback(&["delete_auth_user".to_string()], now())
            .unwrap();

        assert_eq!(saga.status(), SagaStatus::RolledBack);
        assert_eq!(
            saga.metadata().get(META_COMPENSATION_FAILURES).unwrap(),
            "delete_auth_user"
        );
    }

    #[test]
    fn test_expiry_is_strict() {
        let created = now();
        let saga = SagaState::new("u1", Duration::from_secs(10), created);
        assert!(!saga.is_expired(saga.expires_at()));
        assert!(saga.is_expired(saga.expires_at() + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_json_roundtrip_preserves_state() {
        let saga = in_progress()
            .record_step_failure(STEP_DELETE_AUTH_USER, Some("x"), now())
            .unwrap();
        let json = serde_json::to_string(&saga).unwrap();
        let back: SagaState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, saga);
        assert!(json.contains("\"status\":\"in_progress\""));
    }
}
