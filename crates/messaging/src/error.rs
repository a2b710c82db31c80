use thiserror::Error;

/// Errors raised by message bus implementations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport could not complete the operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Creating a subscription or consumer failed.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The bus has been closed.
    #[error("Message bus closed")]
    Closed,
}

/// Result type for message bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
