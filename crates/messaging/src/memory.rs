use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::{
    BusError, Result,
    bus::{AckHandle, Delivery, MessageBus, OffsetReset, OutboundMessage, PartitionClaim},
    partition_for,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message: OutboundMessage,
}

/// (group, topic, partition)
type OffsetKey = (String, String, u32);

#[derive(Default)]
struct BusState {
    logs: HashMap<String, Vec<Vec<StoredMessage>>>,
    committed: HashMap<OffsetKey, u64>,
    next_seq: u64,
}

impl BusState {
    fn partitions_mut(&mut self, topic: &str, partitions: u32) -> &mut Vec<Vec<StoredMessage>> {
        self.logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize])
    }
}

struct Inner {
    partitions: u32,
    offset_reset: OffsetReset,
    redelivery_delay: Duration,
    state: Mutex<BusState>,
    notify: watch::Sender<u64>,
    fail_publishes: AtomicU32,
    closed: AtomicBool,
}

/// In-process partitioned message bus.
///
/// Each topic is split into a fixed number of append-only partition logs.
/// Consumer groups track a committed offset per partition, so an
/// unacknowledged message is handed out again, mirroring broker semantics.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    inner: Arc<Inner>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new(4)
    }
}

impl InMemoryMessageBus {
    /// Creates a bus with `partitions` partitions per topic.
    pub fn new(partitions: u32) -> Self {
        Self::with_options(partitions, OffsetReset::Earliest, Duration::ZERO)
    }

    pub fn with_options(
        partitions: u32,
        offset_reset: OffsetReset,
        redelivery_delay: Duration,
    ) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                offset_reset,
                redelivery_delay,
                state: Mutex::new(BusState::default()),
                notify,
                fail_publishes: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Makes the next `n` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Returns every message published to `topic`, in publish order.
    pub async fn messages(&self, topic: &str) -> Vec<OutboundMessage> {
        let state = self.inner.state.lock().await;
        let mut all: Vec<&StoredMessage> = state
            .logs
            .get(topic)
            .map(|parts| parts.iter().flatten().collect())
            .unwrap_or_default();
        all.sort_by_key(|m| m.seq);
        all.into_iter().map(|m| m.message.clone()).collect()
    }

    /// Returns every message published on any topic, in publish order.
    pub async fn all_messages(&self) -> Vec<OutboundMessage> {
        let state = self.inner.state.lock().await;
        let mut all: Vec<&StoredMessage> = state.logs.values().flatten().flatten().collect();
        all.sort_by_key(|m| m.seq);
        all.into_iter().map(|m| m.message.clone()).collect()
    }

    /// Returns the committed offset of `group` on one partition.
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        let state = self.inner.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Returns how many messages of `topic` the group has not yet committed.
    pub async fn lag(&self, group: &str, topic: &str) -> u64 {
        let state = self.inner.state.lock().await;
        let Some(parts) = state.logs.get(topic) else {
            return 0;
        };
        parts
            .iter()
            .enumerate()
            .map(|(p, log)| {
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), p as u32))
                    .copied()
                    .unwrap_or(0);
                (log.len() as u64).saturating_sub(committed)
            })
            .sum()
    }

    /// Forgets every published message and committed offset.
    pub async fn clear(&self) {
        *self.inner.state.lock().await = BusState::default();
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let injected = self
            .inner
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Transport("injected publish failure".to_string()));
        }

        let partition = partition_for(&message.key, self.inner.partitions);
        {
            let mut state = self.inner.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            let parts = state.partitions_mut(&message.topic, self.inner.partitions);
            parts[partition as usize].push(StoredMessage { seq, message });
        }
        self.inner.notify.send_modify(|v| *v = v.wrapping_add(1));
        Ok(())
    }

    async fn subscribe(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<Vec<Box<dyn PartitionClaim>>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::new();
        let mut state = self.inner.state.lock().await;
        for topic in topics {
            for partition in 0..self.inner.partitions {
                let start = match self.inner.offset_reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => {
                        state.partitions_mut(topic, self.inner.partitions)[partition as usize]
                            .len() as u64
                    }
                };
                state
                    .committed
                    .entry((group.to_string(), topic.clone(), partition))
                    .or_insert(start);

                claims.push(Box::new(InMemoryClaim {
                    inner: self.inner.clone(),
                    group: group.to_string(),
                    topic: topic.clone(),
                    partition,
                    wake: self.inner.notify.subscribe(),
                }));
            }
        }
        Ok(claims)
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.send_modify(|v| *v = v.wrapping_add(1));
        Ok(())
    }
}

struct InMemoryClaim {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    partition: u32,
    wake: watch::Receiver<u64>,
}

#[async_trait]
impl PartitionClaim for InMemoryClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Option<Result<Delivery>> {
        loop {
            self.wake.borrow_and_update();
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }

            {
                let state = self.inner.state.lock().await;
                let offset = state
                    .committed
                    .get(&(self.group.clone(), self.topic.clone(), self.partition))
                    .copied()
                    .unwrap_or(0);
                let stored = state
                    .logs
                    .get(&self.topic)
                    .and_then(|parts| parts.get(self.partition as usize))
                    .and_then(|log| log.get(offset as usize));

                if let Some(stored) = stored {
                    let message = stored.message.clone();
                    let handle = InMemoryAck {
                        inner: self.inner.clone(),
                        group: self.group.clone(),
                        topic: self.topic.clone(),
                        partition: self.partition,
                        offset,
                    };
                    return Some(Ok(Delivery::new(
                        message.topic,
                        self.partition,
                        offset,
                        message.key,
                        message.payload,
                        message.headers,
                        Box::new(handle),
                    )));
                }
            }

            if self.wake.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct InMemoryAck {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    partition: u32,
    offset: u64,
}

#[async_trait]
impl AckHandle for InMemoryAck {
    async fn ack(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone(), self.partition))
            .or_insert(0);
        if *committed == self.offset {
            *committed = self.offset + 1;
        }
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        if !self.inner.redelivery_delay.is_zero() {
            tokio::time::sleep(self.inner.redelivery_delay).await;
        }
        Ok(())
    }
}
