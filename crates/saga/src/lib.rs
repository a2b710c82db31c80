//! Saga orchestration for cascading user deletion.
//!
//! A `UserDeletionRequested` event starts a saga that asks the auth, team,
//! board and task services, in that order, to delete the user. Each step
//! is a command event; the saga advances when the matching result event
//! arrives. A step that keeps failing, or a saga that outlives its
//! deadline, triggers compensation of the completed steps in reverse order.
//!
//! Saga state lives in a [`state_store::KeyValueStore`] and events travel
//! over a [`messaging::MessageBus`], so the engine runs unchanged against
//! the in-memory backends in tests and Postgres/NATS in production.

pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;
pub mod repository;
pub mod saga_state;
pub mod state;
pub mod timeout_monitor;

pub use config::{ConsumerConfig, PublisherConfig, SagaConfig};
pub use consumer::{Disposition, EventConsumer, EventHandler, process_delivery};
pub use error::{Result, SagaError};
pub use events::{Event, EventType, SAGA_TOPIC, Service};
pub use orchestrator::{Orchestrator, Outcome};
pub use pipeline::{Pipeline, Step};
pub use publisher::EventPublisher;
pub use repository::SagaRepository;
pub use saga_state::SagaState;
pub use state::SagaStatus;
pub use timeout_monitor::{SweepReport, TimeoutMonitor};
