//! Saga engine for cascading user deletion.

use chrono::Utc;
use common::SagaId;
use messaging::MessageBus;
use serde_json::Value;
use state_store::KeyValueStore;

use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::events::{Event, EventType, SAGA_TOPIC};
use crate::pipeline::{Pipeline, Step};
use crate::publisher::EventPublisher;
use crate::repository::SagaRepository;
use crate::saga_state::SagaState;
use crate::state::SagaStatus;

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The saga was created or moved; carries the stored snapshot.
    Applied(SagaState),
    /// Nothing to do: duplicate, stale or not addressed to the orchestrator.
    Ignored(&'static str),
}

impl Outcome {
    pub fn saga(&self) -> Option<&SagaState> {
        match self {
            Outcome::Applied(saga) => Some(saga),
            Outcome::Ignored(_) => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Outcome::Ignored(_))
    }
}

/// Drives user deletion sagas from inbound events.
///
/// Steps are dispatched as command events and advanced only by later
/// result events; nothing blocks waiting for a reply. Every transition is
/// computed on a freshly loaded snapshot and written back before any
/// event is published.
pub struct Orchestrator<S, B> {
    repository: SagaRepository<S>,
    publisher: EventPublisher<B>,
    pipeline: Pipeline,
    config: SagaConfig,
}

impl<S, B> Orchestrator<S, B>
where
    S: KeyValueStore,
    B: MessageBus,
{
    pub fn new(
        repository: SagaRepository<S>,
        publisher: EventPublisher<B>,
        pipeline: Pipeline,
        config: SagaConfig,
    ) -> Self {
        Self {
            repository,
            publisher,
            pipeline,
            config,
        }
    }

    pub fn repository(&self) -> &SagaRepository<S> {
        &self.repository
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Dispatches one inbound event.
    pub async fn handle_event(&self, event: &Event) -> Result<Outcome> {
        match &event.event_type {
            EventType::UserDeletionRequested => self.handle_deletion_requested(event).await,
            EventType::UserDeleted(_) | EventType::UserDeleteFailed(_) => {
                match self.pipeline.step_for_result(&event.event_type) {
                    Some((step, true)) => self.handle_step_succeeded(event, &step.name).await,
                    Some((step, false)) => self.handle_step_failed(event, &step.name).await,
                    None => Ok(Outcome::Ignored("result for a step outside the pipeline")),
                }
            }
            // Our own lifecycle notifications come back on the saga topic
            EventType::UserDeletionCompleted | EventType::UserDeletionRollback => {
                Ok(Outcome::Ignored("saga lifecycle notification"))
            }
            EventType::UserDeleteRequested(_) | EventType::UserDeleteRollback(_) => {
                Ok(Outcome::Ignored("command addressed to a service"))
            }
            EventType::Unknown(name) => {
                tracing::info!(event_type = %name, event_id = %event.id, "ignoring unknown event type");
                Ok(Outcome::Ignored("unknown event type"))
            }
        }
    }

    /// Starts a saga for the user named in the request.
    #[tracing::instrument(skip(self, event), fields(user_id = %event.user_id))]
    pub async fn handle_deletion_requested(&self, event: &Event) -> Result<Outcome> {
        if event.user_id.trim().is_empty() {
            tracing::warn!(event_id = %event.id, "deletion request without user id");
            return Ok(Outcome::Ignored("deletion request without user id"));
        }

        let saga = SagaState::new(event.user_id.clone(), self.config.timeout, Utc::now());
        self.repository.save(&saga).await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %saga.id(), "saga started");

        self.advance(saga).await
    }

    /// Records a successful step and moves on.
    #[tracing::instrument(skip(self, event), fields(saga_id = %event.saga_id))]
    pub async fn handle_step_succeeded(&self, event: &Event, step: &str) -> Result<Outcome> {
        let Some(saga) = self.load_for_result(event).await? else {
            return Ok(Outcome::Ignored("unknown saga"));
        };
        if saga.status() != SagaStatus::InProgress {
            tracing::info!(status = %saga.status(), "discarding result for saga not in progress");
            return Ok(Outcome::Ignored("saga not in progress"));
        }
        if saga.is_step_completed(step) {
            tracing::info!("discarding duplicate step result");
            return Ok(Outcome::Ignored("step already completed"));
        }

        let saga = saga.record_step_completed(step, &self.pipeline, Utc::now())?;
        self.repository.save(&saga).await?;
        tracing::info!(completed = saga.completed_steps().len(), "step completed");

        self.advance(saga).await
    }

    /// Retries a failed step or, once retries are used up, compensates.
    ///
    /// The retry pause happens inside the handler and holds the consumer
    /// worker for `retry_interval`.
    #[tracing::instrument(skip(self, event), fields(saga_id = %event.saga_id))]
    pub async fn handle_step_failed(&self, event: &Event, step: &str) -> Result<Outcome> {
        let Some(saga) = self.load_for_result(event).await? else {
            return Ok(Outcome::Ignored("unknown saga"));
        };
        if saga.status() != SagaStatus::InProgress {
            tracing::info!(status = %saga.status(), "discarding failure for saga not in progress");
            return Ok(Outcome::Ignored("saga not in progress"));
        }
        if saga.is_step_completed(step) {
            tracing::info!("discarding failure for a step already completed");
            return Ok(Outcome::Ignored("step already completed"));
        }

        let reason = event.error_message().unwrap_or("step reported failure");
        let saga = saga.record_step_failure(step, Some(reason), Utc::now())?;
        self.repository.save(&saga).await?;
        tracing::warn!(reason, retry_count = saga.retry_count(), "step failed");

        if saga.retry_count() >= self.config.max_retries {
            return self.start_compensation(saga, reason).await;
        }

        let step = self
            .pipeline
            .step(step)
            .ok_or_else(|| SagaError::UnknownStep(step.to_string()))?;
        metrics::counter!("saga_step_retries_total").increment(1);
        tokio::time::sleep(self.config.retry_interval).await;
        self.execute_step(saga, step).await
    }

    /// Runs the first incomplete step or completes the saga.
    async fn advance(&self, saga: SagaState) -> Result<Outcome> {
        match self.pipeline.next_step(saga.completed_steps()) {
            Some(step) => self.execute_step(saga, step).await,
            None => self.complete_saga(saga).await,
        }
    }

    /// Marks `step` current, persists, then publishes its command.
    ///
    /// A command that cannot be published counts as a failed attempt of the
    /// step, so it is retried or compensated like a reported failure.
    pub async fn execute_step(&self, saga: SagaState, step: &Step) -> Result<Outcome> {
        let mut saga = saga;
        loop {
            let started = saga.begin_step(&step.name, Utc::now())?;
            self.repository.save(&started).await?;

            let command = self.command_event(&started, step);
            match self.publisher.publish(&step.topic, &command).await {
                Ok(()) => {
                    tracing::info!(saga_id = %started.id(), step = %step.name, "step dispatched");
                    return Ok(Outcome::Applied(started));
                }
                Err(e @ SagaError::PublishFailed { .. }) => {
                    let reason = e.to_string();
                    let failed = started.record_step_failure(&step.name, Some(reason.as_str()), Utc::now())?;
                    self.repository.save(&failed).await?;
                    tracing::warn!(saga_id = %failed.id(), step = %step.name, error = %reason, "step command not published");

                    if failed.retry_count() >= self.config.max_retries {
                        return self
                            .start_compensation(failed, "step command could not be published")
                            .await;
                    }
                    metrics::counter!("saga_step_retries_total").increment(1);
                    tokio::time::sleep(self.config.retry_interval).await;
                    saga = failed;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves the saga to `rolling_back` and compensates completed steps.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id()))]
    pub async fn start_compensation(&self, saga: SagaState, reason: &str) -> Result<Outcome> {
        let rolling = saga.begin_compensation(reason, Utc::now())?;
        self.repository.save(&rolling).await?;
        tracing::warn!(reason, "saga rolling back");
        self.compensate(rolling).await
    }

    /// Publishes compensations in reverse pipeline order, then finalizes.
    ///
    /// A compensation that cannot be published is logged and recorded on
    /// the saga; it never prevents reaching `rolled_back`.
    async fn compensate(&self, rolling: SagaState) -> Result<Outcome> {
        let mut failures = Vec::new();
        let mut compensated = Vec::new();

        for step in self.pipeline.compensation_plan(rolling.completed_steps()) {
            let event = Event::new(
                step.compensate_event_type.clone(),
                rolling.user_id(),
                Some(rolling.id()),
            )
            .with_data("step", step.name.clone());

            match self.publisher.publish(&step.topic, &event).await {
                Ok(()) => compensated.push(step.name.clone()),
                Err(e) => {
                    tracing::error!(saga_id = %rolling.id(), step = %step.name, error = %e, "compensation not published");
                    failures.push(step.name.clone());
                }
            }
        }

        let rolled_back = rolling.finish_rollback(&failures, Utc::now())?;
        self.repository.save(&rolled_back).await?;

        metrics::counter!("saga_rolled_back_total").increment(1);
        self.record_duration(&rolled_back, "rolled_back");
        tracing::info!(saga_id = %rolled_back.id(), compensated = compensated.len(), failed = failures.len(), "saga rolled back");

        let notification = Event::new(
            EventType::UserDeletionRollback,
            rolled_back.user_id(),
            Some(rolled_back.id()),
        )
        .with_data("compensated_steps", compensated)
        .with_data("failed_compensations", failures);
        self.notify(notification).await;

        Ok(Outcome::Applied(rolled_back))
    }

    /// Finalizes a saga whose steps all succeeded.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id()))]
    pub async fn complete_saga(&self, saga: SagaState) -> Result<Outcome> {
        let completed = saga.complete(Utc::now())?;
        self.repository.save(&completed).await?;

        metrics::counter!("saga_completed_total").increment(1);
        self.record_duration(&completed, "completed");
        tracing::info!("saga completed");

        let notification = Event::new(
            EventType::UserDeletionCompleted,
            completed.user_id(),
            Some(completed.id()),
        )
        .with_data("completed_steps", completed.completed_steps().to_vec());
        self.notify(notification).await;

        Ok(Outcome::Applied(completed))
    }

    /// Forces an expired, still active saga into compensation.
    #[tracing::instrument(skip(self))]
    pub async fn expire_saga(&self, id: SagaId, now: chrono::DateTime<Utc>) -> Result<Outcome> {
        let Some(saga) = self.repository.find(id).await? else {
            return Ok(Outcome::Ignored("unknown saga"));
        };
        if !saga.status().is_active() || !saga.is_expired(now) {
            return Ok(Outcome::Ignored("saga no longer expired and active"));
        }

        let rolling = saga.mark_timed_out(now)?;
        self.repository.save(&rolling).await?;
        metrics::counter!("saga_timeouts_total").increment(1);
        tracing::warn!(status = %saga.status(), step = ?saga.current_step(), "saga timed out");

        self.compensate(rolling).await
    }

    /// Finishes an expired saga whose compensation was cut short.
    ///
    /// Every completed step is compensated again, so services see the
    /// rollback command at least once.
    #[tracing::instrument(skip(self))]
    pub async fn resume_compensation(&self, id: SagaId, now: chrono::DateTime<Utc>) -> Result<Outcome> {
        let Some(saga) = self.repository.find(id).await? else {
            return Ok(Outcome::Ignored("unknown saga"));
        };
        if saga.status() != SagaStatus::RollingBack || !saga.is_expired(now) {
            return Ok(Outcome::Ignored("saga no longer a stalled rollback"));
        }

        let rolling = saga.resume_compensation(now)?;
        self.repository.save(&rolling).await?;
        metrics::counter!("saga_rollbacks_resumed_total").increment(1);
        tracing::warn!(completed = rolling.completed_steps().len(), "resuming interrupted rollback");

        self.compensate(rolling).await
    }

    async fn load_for_result(&self, event: &Event) -> Result<Option<SagaState>> {
        let Some(id) = event.saga_id() else {
            tracing::warn!(event_id = %event.id, event_type = %event.event_type, "result without a valid saga id");
            return Ok(None);
        };
        let saga = self.repository.find(id).await?;
        if saga.is_none() {
            tracing::warn!(event_id = %event.id, event_type = %event.event_type, "result for unknown saga");
        }
        Ok(saga)
    }

    fn command_event(&self, saga: &SagaState, step: &Step) -> Event {
        let deadline = chrono::Duration::from_std(step.timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_add_signed(timeout));

        let mut event = Event::new(
            step.command_event_type.clone(),
            saga.user_id(),
            Some(saga.id()),
        )
        .with_data("step", step.name.clone());
        if let Some(deadline) = deadline {
            event = event.with_data("deadline", Value::String(deadline.to_rfc3339()));
        }
        event
    }

    /// Publishes a saga-level notification; the saga is already final.
    async fn notify(&self, event: Event) {
        if let Err(e) = self.publisher.publish(SAGA_TOPIC, &event).await {
            tracing::error!(saga_id = %event.saga_id, event_type = %event.event_type, error = %e, "saga notification not published");
        }
    }

    fn record_duration(&self, saga: &SagaState, outcome: &'static str) {
        let elapsed = (saga.updated_at() - saga.created_at())
            .to_std()
            .unwrap_or_default();
        metrics::histogram!("saga_duration_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
    }
}
