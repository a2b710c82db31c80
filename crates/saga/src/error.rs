//! Saga error types.

use common::SagaId;
use messaging::BusError;
use state_store::StoreError;
use thiserror::Error;

use crate::state::SagaStatus;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The requested status change is not allowed from the current status.
    #[error("Invalid transition for saga {saga_id}: {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// No saga is stored under the given ID.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A step name does not belong to the pipeline.
    #[error("Unknown saga step: {0}")]
    UnknownStep(String),

    /// The pipeline definition is unusable.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Publishing gave up after exhausting its retries.
    #[error("Publishing {event_type} to {topic} failed after {attempts} attempts: {source}")]
    PublishFailed {
        topic: String,
        event_type: String,
        attempts: u32,
        #[source]
        source: BusError,
    },

    /// State store error.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Message bus error.
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the failed operation should be retried by redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Store(e) => e.is_transient(),
            SagaError::Bus(_) | SagaError::PublishFailed { .. } => true,
            SagaError::InvalidTransition { .. }
            | SagaError::NotFound(_)
            | SagaError::UnknownStep(_)
            | SagaError::InvalidPipeline(_)
            | SagaError::Serialization(_) => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_follow_store_classification() {
        let outage = SagaError::from(StoreError::Unavailable("down".to_string()));
        assert!(outage.is_transient());

        let bad_ttl = SagaError::from(StoreError::InvalidTtl("too large".to_string()));
        assert!(!bad_ttl.is_transient());
    }

    #[test]
    fn test_domain_errors_are_permanent() {
        assert!(!SagaError::UnknownStep("x".to_string()).is_transient());
        assert!(!SagaError::NotFound(SagaId::new()).is_transient());
        assert!(SagaError::Bus(BusError::Transport("down".to_string())).is_transient());
    }
}
