//! Identifier types shared across the saga orchestrator crates.

pub mod ids;

pub use ids::{EventId, ParseIdError, SagaId};
