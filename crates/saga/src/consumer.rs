//! Consumes saga and result topics and feeds the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use messaging::{Delivery, MessageBus, PartitionClaim};
use state_store::KeyValueStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::events::Event;
use crate::orchestrator::{Orchestrator, Outcome};

/// Something that reacts to decoded events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<Outcome>;
}

#[async_trait]
impl<S, B> EventHandler for Orchestrator<S, B>
where
    S: KeyValueStore,
    B: MessageBus,
{
    async fn handle(&self, event: &Event) -> Result<Outcome> {
        self.handle_event(event).await
    }
}

/// What the consumer did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled and acknowledged.
    Acked,
    /// Undecodable or permanently failing; acknowledged so it is not retried.
    Dropped,
    /// Left unacknowledged for redelivery.
    Redeliver,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Dropped => "dropped",
            Disposition::Redeliver => "redeliver",
        }
    }
}

/// Decodes one delivery, hands it to `handler` and settles it.
///
/// Handler errors that a retry may fix leave the message unacknowledged.
/// Malformed payloads and permanent errors are acknowledged and logged.
///
/// The handler always runs to completion: stopping it between a saga write
/// and the publishes that follow would strand the saga. A handler that
/// takes longer than `max_processing_time` is only reported.
pub async fn process_delivery<H>(
    handler: &H,
    delivery: Delivery,
    max_processing_time: Duration,
) -> Disposition
where
    H: EventHandler + ?Sized,
{
    let event = match Event::from_slice(&delivery.payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %e,
                "dropping malformed message"
            );
            return settle(delivery, Disposition::Dropped, "malformed").await;
        }
    };
    let event_type = event.event_type.name();

    let started = Instant::now();
    let result = handler.handle(&event).await;
    let elapsed = started.elapsed();
    if elapsed > max_processing_time {
        metrics::counter!("saga_handler_overruns_total", "type" => event_type.to_string())
            .increment(1);
        tracing::warn!(
            event_type = %event_type,
            saga_id = %event.saga_id,
            ?elapsed,
            limit = ?max_processing_time,
            "event handler exceeded its processing budget"
        );
    }

    let disposition = match result {
        Ok(outcome) => {
            tracing::debug!(event_type = %event_type, saga_id = %event.saga_id, ignored = outcome.is_ignored(), "event handled");
            Disposition::Acked
        }
        Err(e) if e.is_transient() => {
            tracing::warn!(event_type = %event_type, saga_id = %event.saga_id, error = %e, "event handling failed, leaving for redelivery");
            Disposition::Redeliver
        }
        Err(e) => {
            tracing::error!(event_type = %event_type, saga_id = %event.saga_id, error = %e, "event handling failed permanently, dropping");
            Disposition::Dropped
        }
    };

    settle(delivery, disposition, &event_type).await
}

async fn settle(delivery: Delivery, disposition: Disposition, event_type: &str) -> Disposition {
    let topic = delivery.topic.clone();
    let settled = match disposition {
        Disposition::Acked | Disposition::Dropped => delivery.ack().await,
        Disposition::Redeliver => delivery.nack().await,
    };
    if let Err(e) = settled {
        tracing::warn!(%topic, error = %e, "failed to settle delivery");
    }

    metrics::counter!(
        "saga_events_processed_total",
        "type" => event_type.to_string(),
        "result" => disposition.as_str()
    )
    .increment(1);
    disposition
}

/// Subscribes to the inbound topics and runs one worker per partition.
pub struct EventConsumer<B, H> {
    bus: Arc<B>,
    handler: Arc<H>,
    topics: Vec<String>,
    config: ConsumerConfig,
    ready: Arc<AtomicBool>,
}

impl<B, H> EventConsumer<B, H>
where
    B: MessageBus + 'static,
    H: EventHandler + 'static,
{
    pub fn new(bus: Arc<B>, handler: Arc<H>, topics: Vec<String>, config: ConsumerConfig) -> Self {
        Self {
            bus,
            handler,
            topics,
            config,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised once every partition is claimed and cleared on exit.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Consumes until `shutdown` flips to true or the bus closes.
    ///
    /// A message already being handled is finished before its worker exits.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let claims = self
            .bus
            .subscribe(&self.config.group_id, &self.topics)
            .await?;
        tracing::info!(
            group = %self.config.group_id,
            topics = ?self.topics,
            workers = claims.len(),
            "event consumer started"
        );
        self.ready.store(true, Ordering::SeqCst);

        let mut workers = JoinSet::new();
        for claim in claims {
            workers.spawn(consume_partition(
                claim,
                self.handler.clone(),
                self.config.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "consumer worker panicked");
            }
        }

        self.ready.store(false, Ordering::SeqCst);
        tracing::info!("event consumer stopped");
        Ok(())
    }
}

async fn consume_partition<H>(
    mut claim: Box<dyn PartitionClaim>,
    handler: Arc<H>,
    config: ConsumerConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    H: EventHandler + 'static,
{
    let topic = claim.topic().to_string();
    let partition = claim.partition();
    tracing::debug!(%topic, partition, "partition worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = claim.next() => next,
        };

        match next {
            None => break,
            Some(Ok(delivery)) => {
                process_delivery(handler.as_ref(), delivery, config.max_processing_time).await;
            }
            Some(Err(e)) => {
                tracing::warn!(%topic, partition, error = %e, "receive failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    tracing::debug!(%topic, partition, "partition worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::SagaError;
    use crate::events::{EventType, Service};
    use messaging::{InMemoryMessageBus, OutboundMessage};

    /// Handler scripted with a queue of results.
    #[derive(Default)]
    struct ScriptedHandler {
        results: Mutex<Vec<Result<Outcome>>>,
        seen: Mutex<Vec<EventType>>,
        delay: Option<Duration>,
    }

    impl ScriptedHandler {
        fn returning(results: Vec<Result<Outcome>>) -> Self {
            Self {
                results: Mutex::new(results),
                ..Default::default()
            }
        }

        fn seen(&self) -> Vec<EventType> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, event: &Event) -> Result<Outcome> {
            self.seen.lock().unwrap().push(event.event_type.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(Outcome::Ignored("scripted"))
            } else {
                results.remove(0)
            }
        }
    }

    async fn deliver(bus: &InMemoryMessageBus, payload: Vec<u8>) -> Delivery {
        bus.publish(OutboundMessage::new("t", "u1", payload))
            .await
            .unwrap();
        let mut claims = bus.subscribe("g", &["t".to_string()]).await.unwrap();
        claims.retain(|c| c.partition() == messaging::partition_for("u1", bus.partitions()));
        claims.remove(0).next().await.unwrap().unwrap()
    }

    fn event_bytes() -> Vec<u8> {
        Event::new(EventType::UserDeleted(Service::Auth), "u1", None)
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let bus = InMemoryMessageBus::new(1);
        let handler = ScriptedHandler::default();

        let delivery = deliver(&bus, event_bytes()).await;
        let d = process_delivery(&handler, delivery, Duration::from_secs(1)).await;

        assert_eq!(d, Disposition::Acked);
        assert_eq!(bus.lag("g", "t").await, 0);
        assert_eq!(handler.seen(), vec![EventType::UserDeleted(Service::Auth)]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped_without_handling() {
        let bus = InMemoryMessageBus::new(1);
        let handler = ScriptedHandler::default();

        let delivery = deliver(&bus, b"{\"type\":".to_vec()).await;
        let d = process_delivery(&handler, delivery, Duration::from_secs(1)).await;

        assert_eq!(d, Disposition::Dropped);
        assert_eq!(bus.lag("g", "t").await, 0);
        assert!(handler.seen().is_empty());
    }

    #[tokio::test]
    async fn test_result_with_null_data_is_handled() {
        let bus = InMemoryMessageBus::new(1);
        let handler = ScriptedHandler::default();
        let payload = br#"{"id":"e1","type":"BoardUserDeleted","user_id":"u1","saga_id":"","timestamp":"2024-05-01T10:00:00Z","data":null,"headers":null}"#;

        let delivery = deliver(&bus, payload.to_vec()).await;
        let d = process_delivery(&handler, delivery, Duration::from_secs(1)).await;

        assert_eq!(d, Disposition::Acked);
        assert_eq!(handler.seen(), vec![EventType::UserDeleted(Service::Board)]);
    }

    #[tokio::test]
    async fn test_transient_error_leaves_message_for_redelivery() {
        let bus = InMemoryMessageBus::new(1);
        let handler = ScriptedHandler::returning(vec![Err(SagaError::Bus(
            messaging::BusError::Transport("down".to_string()),
        ))]);

        let delivery = deliver(&bus, event_bytes()).await;
        let d = process_delivery(&handler, delivery, Duration::from_secs(1)).await;

        assert_eq!(d, Disposition::Redeliver);
        assert_eq!(bus.lag("g", "t").await, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_dropped() {
        let bus = InMemoryMessageBus::new(1);
        let handler =
            ScriptedHandler::returning(vec![Err(SagaError::UnknownStep("x".to_string()))]);

        let delivery = deliver(&bus, event_bytes()).await;
        let d = process_delivery(&handler, delivery, Duration::from_secs(1)).await;

        assert_eq!(d, Disposition::Dropped);
        assert_eq!(bus.lag("g", "t").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_runs_to_completion_and_is_acked() {
        let bus = InMemoryMessageBus::new(1);
        let handler = ScriptedHandler {
            results: Mutex::new(vec![Ok(Outcome::Ignored("finished late"))]),
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let delivery = deliver(&bus, event_bytes()).await;
        let d = process_delivery(&handler, delivery, Duration::from_secs(1)).await;

        assert_eq!(d, Disposition::Acked);
        assert_eq!(bus.lag("g", "t").await, 0);
        assert!(handler.results.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_redelivers_until_handled_then_stops_on_shutdown() {
        let bus = Arc::new(InMemoryMessageBus::new(2));
        let handler = Arc::new(ScriptedHandler::returning(vec![
            Err(SagaError::Bus(messaging::BusError::Transport("down".to_string()))),
            Ok(Outcome::Ignored("done")),
        ]));
        let consumer = EventConsumer::new(
            bus.clone(),
            handler.clone(),
            vec!["t".to_string()],
            ConsumerConfig {
                group_id: "g".to_string(),
                ..ConsumerConfig::default()
            },
        );
        let ready = consumer.ready_flag();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(rx));

        bus.publish(OutboundMessage::new("t", "u1", event_bytes()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.lag("g", "t").await > 0 || handler.seen().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message handled after redelivery");
        assert!(ready.load(Ordering::SeqCst));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(!ready.load(Ordering::SeqCst));
        assert_eq!(handler.seen().len(), 2);
    }
}
