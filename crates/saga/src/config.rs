//! Tunables for the saga engine and its bus adapters.

use std::time::Duration;

use messaging::OffsetReset;

/// Saga-level policy.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Lifetime of a saga; `expires_at = created_at + timeout`.
    pub timeout: Duration,
    /// Pause before re-dispatching a failed step.
    pub retry_interval: Duration,
    /// Failed attempts tolerated before compensation starts.
    pub max_retries: u32,
    /// Period of the timeout monitor sweep.
    pub cleanup_interval: Duration,
    /// How long a saga stays in the store after it expires or finishes.
    pub retention: Duration,
    /// Deadline attached to every step command.
    pub step_timeout: Duration,
    /// Page size used when scanning the store.
    pub scan_page_size: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            step_timeout: Duration::from_secs(30),
            scan_page_size: 100,
        }
    }
}

/// Retry policy of the event publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl PublisherConfig {
    /// Backoff before retry number `retry` (1-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Event consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// Upper bound on handling one message before it is left for redelivery.
    pub max_processing_time: Duration,
    pub offset_reset: OffsetReset,
    /// Pause after a transport error before polling the partition again.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "saga-orchestrator".to_string(),
            max_processing_time: Duration::from_secs(5 * 60),
            offset_reset: OffsetReset::Earliest,
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PublisherConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(5), Duration::from_secs(16));
        assert_eq!(config.backoff(6), Duration::from_secs(30));
        assert_eq!(config.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let saga = SagaConfig::default();
        assert_eq!(saga.max_retries, 3);
        assert_eq!(saga.retention, Duration::from_secs(86_400));
        assert_eq!(ConsumerConfig::default().group_id, "saga-orchestrator");
    }
}
