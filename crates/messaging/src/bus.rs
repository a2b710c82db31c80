use std::collections::HashMap;

use async_trait::async_trait;

use crate::Result;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Partition key. Messages with equal keys keep their relative order.
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Where a consumer group starts reading a partition it has never committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl std::str::FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(format!("unknown offset reset policy: {other}")),
        }
    }
}

/// Backend-specific acknowledgement of one delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Marks the delivery processed so it is not delivered again.
    async fn ack(&self) -> Result<()>;

    /// Rejects the delivery so it is delivered again.
    async fn nack(&self) -> Result<()>;
}

/// A message received from a partition claim.
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        partition: u32,
        offset: u64,
        key: String,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key,
            payload,
            headers,
            handle,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.handle.ack().await
    }

    pub async fn nack(self) -> Result<()> {
        self.handle.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// An ordered stream of deliveries from one (topic, partition).
///
/// At most one delivery is outstanding at a time. If it is nacked or
/// dropped without an ack, the next call to [`PartitionClaim::next`]
/// returns the same message again.
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> u32;

    /// Waits for the next delivery. Returns `None` once the bus is closed.
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

/// Publish/subscribe transport with per-key ordering and consumer groups.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message and waits for the broker to accept it.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Joins `group` on every partition of `topics`.
    async fn subscribe(&self, group: &str, topics: &[String])
    -> Result<Vec<Box<dyn PartitionClaim>>>;

    /// Stops delivering messages and flushes pending publishes.
    async fn close(&self) -> Result<()>;
}

/// Maps a partition key onto one of `partitions` partitions.
///
/// Uses 32-bit FNV-1a so the mapping is stable across processes and releases.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    });
    hash % partitions.max(1)
}
