use thiserror::Error;

/// Errors that can occur when interacting with the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The requested TTL cannot be represented by the backend.
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if retrying the operation later may succeed.
    ///
    /// Only a TTL the backend cannot represent is permanent; database and
    /// connectivity failures are left for the caller to retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::InvalidTtl(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invalid_ttl_is_permanent() {
        assert!(StoreError::Unavailable("down".to_string()).is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::InvalidTtl("too large".to_string()).is_transient());
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
