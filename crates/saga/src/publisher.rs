//! Reliable event publishing with bounded exponential backoff.

use std::sync::Arc;

use messaging::{MessageBus, OutboundMessage};

use crate::config::PublisherConfig;
use crate::error::{Result, SagaError};
use crate::events::Event;

pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_SAGA_ID: &str = "saga_id";

/// Publishes [`Event`]s keyed by user ID.
///
/// Keying by user keeps every event of one user's saga on one partition,
/// so they are consumed in the order they were published.
pub struct EventPublisher<B> {
    bus: Arc<B>,
    config: PublisherConfig,
}

impl<B> Clone for EventPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: MessageBus> EventPublisher<B> {
    pub fn new(bus: Arc<B>, config: PublisherConfig) -> Self {
        Self { bus, config }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Builds the bus message for `event`.
    pub fn to_message(topic: &str, event: &Event) -> Result<OutboundMessage> {
        let mut message = OutboundMessage::new(topic, event.user_id.clone(), event.to_bytes()?);
        message.headers = event.headers.clone();
        message
            .headers
            .insert(HEADER_EVENT_TYPE.to_string(), event.event_type.name());
        message
            .headers
            .insert(HEADER_SAGA_ID.to_string(), event.saga_id.clone());
        Ok(message)
    }

    /// Publishes `event` to `topic`, retrying transport errors.
    ///
    /// Returns [`SagaError::PublishFailed`] once the retries are exhausted.
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, saga_id = %event.saga_id, user_id = %event.user_id)
    )]
    pub async fn publish(&self, topic: &str, event: &Event) -> Result<()> {
        let message = Self::to_message(topic, event)?;
        let attempts = self.config.max_retries.saturating_add(1);

        let mut attempt = 1;
        loop {
            match self.bus.publish(message.clone()).await {
                Ok(()) => {
                    tracing::debug!(attempt, "event published");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let backoff = self.config.backoff(attempt);
                    tracing::warn!(attempt, ?backoff, error = %e, "publish failed, retrying");
                    metrics::counter!("saga_publish_retries_total").increment(1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempts, error = %e, "publish failed, giving up");
                    metrics::counter!("saga_publish_failures_total").increment(1);
                    return Err(SagaError::PublishFailed {
                        topic: topic.to_string(),
                        event_type: event.event_type.name(),
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}
