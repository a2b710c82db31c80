//! Periodic sweep that rolls back sagas past their deadline and finishes
//! rollbacks that were interrupted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use messaging::MessageBus;
use state_store::KeyValueStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::orchestrator::{Orchestrator, Outcome};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub found: usize,
    pub rolled_back: usize,
    /// Interrupted rollbacks finished by this sweep.
    pub resumed: usize,
    pub failed: usize,
}

pub struct TimeoutMonitor<S, B> {
    orchestrator: Arc<Orchestrator<S, B>>,
    interval: Duration,
}

impl<S, B> TimeoutMonitor<S, B>
where
    S: KeyValueStore,
    B: MessageBus,
{
    pub fn new(orchestrator: Arc<Orchestrator<S, B>>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.interval, "timeout monitor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }

        tracing::info!("timeout monitor stopped");
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Rolls back every active saga that expired before `now`, then
    /// finishes every expired saga still stuck in `rolling_back`.
    ///
    /// One saga failing does not stop the others.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let repository = self.orchestrator.repository();
        let expired = repository.list_expired(now).await?;
        let stalled = repository.list_stalled_rollbacks(now).await?;
        let mut report = SweepReport {
            found: expired.len() + stalled.len(),
            ..SweepReport::default()
        };

        for saga in expired {
            match self.orchestrator.expire_saga(saga.id(), now).await {
                Ok(Outcome::Applied(_)) => report.rolled_back += 1,
                Ok(Outcome::Ignored(reason)) => {
                    tracing::debug!(saga_id = %saga.id(), reason, "expired saga skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(saga_id = %saga.id(), error = %e, "failed to roll back expired saga");
                }
            }
        }

        for saga in stalled {
            match self.orchestrator.resume_compensation(saga.id(), now).await {
                Ok(Outcome::Applied(_)) => report.resumed += 1,
                Ok(Outcome::Ignored(reason)) => {
                    tracing::debug!(saga_id = %saga.id(), reason, "stalled rollback skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(saga_id = %saga.id(), error = %e, "failed to resume rollback");
                }
            }
        }

        if report.found > 0 {
            tracing::info!(
                found = report.found,
                rolled_back = report.rolled_back,
                resumed = report.resumed,
                failed = report.failed,
                "timeout sweep finished"
            );
        }
        Ok(report)
    }
}
