//! Message bus contract used by the saga orchestrator.
//!
//! Messages are routed to a partition by key, so every message sharing a key
//! is consumed in publish order by a single claim. Delivery is at-least-once:
//! anything not acknowledged is delivered again.

pub mod bus;
pub mod error;
pub mod memory;
pub mod nats;

pub use bus::{
    AckHandle, Delivery, MessageBus, OffsetReset, OutboundMessage, PartitionClaim, partition_for,
};
pub use error::{BusError, Result};
pub use memory::InMemoryMessageBus;
pub use nats::{NatsBusConfig, NatsMessageBus};
