//! NATS JetStream message bus.
//!
//! Each topic maps to one stream whose subjects are `<topic>.<partition>`.
//! A consumer group owns one durable pull consumer per partition with
//! `max_ack_pending = 1`, which keeps delivery within a partition strictly
//! ordered even across redeliveries.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_nats::HeaderMap;
use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind, Context as JetStreamContext};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::{
    BusError, Result,
    bus::{AckHandle, Delivery, MessageBus, OffsetReset, OutboundMessage, PartitionClaim},
    partition_for,
};

/// Header carrying the partition key, so consumers can recover it.
const KEY_HEADER: &str = "Partition-Key";

/// Connection and topology settings for [`NatsMessageBus`].
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    pub url: String,
    pub partitions: u32,
    pub offset_reset: OffsetReset,
    /// How long JetStream waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Delay applied to redelivery after an explicit nack.
    pub redelivery_delay: Duration,
    /// Retention of messages in each stream.
    pub max_age: Duration,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            partitions: 4,
            offset_reset: OffsetReset::Earliest,
            ack_wait: Duration::from_secs(60),
            redelivery_delay: Duration::from_secs(1),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// [`MessageBus`] backed by NATS JetStream.
pub struct NatsMessageBus {
    client: async_nats::Client,
    jetstream: JetStreamContext,
    config: NatsBusConfig,
    known_streams: Mutex<HashSet<String>>,
}

impl NatsMessageBus {
    /// Connects to the NATS server and enables JetStream.
    pub async fn connect(config: NatsBusConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        info!(url = %config.url, partitions = config.partitions, "connected to NATS JetStream");

        Ok(Self {
            client,
            jetstream,
            config,
            known_streams: Mutex::new(HashSet::new()),
        })
    }

    fn stream_name(topic: &str) -> String {
        topic.to_ascii_uppercase().replace(['-', '.'], "_")
    }

    fn deliver_policy(&self) -> DeliverPolicy {
        match self.config.offset_reset {
            OffsetReset::Earliest => DeliverPolicy::All,
            OffsetReset::Latest => DeliverPolicy::New,
        }
    }

    fn subject(topic: &str, partition: u32) -> String {
        format!("{topic}.{partition}")
    }

    async fn ensure_stream(&self, topic: &str) -> Result<jetstream::stream::Stream> {
        let name = Self::stream_name(topic);
        let stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: name.clone(),
                subjects: vec![format!("{topic}.*")],
                max_age: self.config.max_age,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Subscription(e.to_string()))?;

        if self.known_streams.lock().await.insert(name.clone()) {
            debug!(stream = %name, topic, "stream ready");
        }
        Ok(stream)
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    #[instrument(skip(self, message), fields(topic = %message.topic, key = %message.key))]
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if !self
            .known_streams
            .lock()
            .await
            .contains(&Self::stream_name(&message.topic))
        {
            self.ensure_stream(&message.topic).await?;
        }

        let partition = partition_for(&message.key, self.config.partitions);
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, message.key.as_str());
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(
                Self::subject(&message.topic, partition),
                headers,
                message.payload.into(),
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        // Wait for the stream to confirm storage
        ack.await.map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<Vec<Box<dyn PartitionClaim>>> {
        let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::new();
        for topic in topics {
            let stream = self.ensure_stream(topic).await?;
            for partition in 0..self.config.partitions {
                let durable = format!("{group}-{}-{partition}", Self::stream_name(topic));
                let consumer: jetstream::consumer::PullConsumer = stream
                    .get_or_create_consumer(
                        &durable,
                        PullConsumerConfig {
                            durable_name: Some(durable.clone()),
                            filter_subject: Self::subject(topic, partition),
                            deliver_policy: self.deliver_policy(),
                            ack_policy: AckPolicy::Explicit,
                            ack_wait: self.config.ack_wait,
                            max_ack_pending: 1,
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| BusError::Subscription(e.to_string()))?;

                let messages = consumer
                    .messages()
                    .await
                    .map_err(|e| BusError::Subscription(e.to_string()))?;

                claims.push(Box::new(NatsClaim {
                    topic: topic.clone(),
                    partition,
                    redelivery_delay: self.config.redelivery_delay,
                    messages,
                }));
            }
            info!(topic = %topic, group, partitions = self.config.partitions, "subscribed");
        }
        Ok(claims)
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}

struct NatsClaim {
    topic: String,
    partition: u32,
    redelivery_delay: Duration,
    messages: jetstream::consumer::pull::Stream,
}

#[async_trait]
impl PartitionClaim for NatsClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Result<Delivery>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(BusError::Transport(e.to_string()))),
        };

        let mut headers = HashMap::new();
        if let Some(map) = &message.headers {
            for (name, values) in map.iter() {
                if let Some(value) = values.first() {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }
        let key = headers.remove(KEY_HEADER).unwrap_or_default();
        let offset = message.info().map(|i| i.stream_sequence).unwrap_or(0);
        let payload = message.payload.to_vec();

        Some(Ok(Delivery::new(
            self.topic.clone(),
            self.partition,
            offset,
            key,
            payload,
            headers,
            Box::new(NatsAck {
                message,
                redelivery_delay: self.redelivery_delay,
            }),
        )))
    }
}

struct NatsAck {
    message: jetstream::Message,
    redelivery_delay: Duration,
}

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn nack(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(self.redelivery_delay)))
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}
