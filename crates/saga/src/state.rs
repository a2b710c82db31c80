//! Saga status state machine.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► InProgress ──┬──► Completed
///    │                     └──► RollingBack ──► RolledBack
///    └── (timeout) ────────────► RollingBack
/// ```
///
/// `InProgress → InProgress` covers advancing to the next step and
/// re-dispatching a step after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Saga has been created but no step has been dispatched.
    #[default]
    Pending,

    /// A step command has been dispatched and the saga awaits results.
    InProgress,

    /// Every step succeeded (terminal state).
    Completed,

    /// Completed steps are being compensated.
    RollingBack,

    /// Compensation finished (terminal state).
    RolledBack,
}

impl SagaStatus {
    pub const ALL: [SagaStatus; 5] = [
        SagaStatus::Pending,
        SagaStatus::InProgress,
        SagaStatus::Completed,
        SagaStatus::RollingBack,
        SagaStatus::RolledBack,
    ];

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (*self, next),
            (Pending, InProgress)
                | (Pending, RollingBack)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, RollingBack)
                | (RollingBack, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    /// Returns true if the saga is still waiting on downstream work.
    pub fn is_active(&self) -> bool {
        matches!(self, SagaStatus::Pending | SagaStatus::InProgress)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::RolledBack)
    }

    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Completed => "completed",
            SagaStatus::RollingBack => "rolling_back",
            SagaStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown saga status: {s}"))
    }
}
