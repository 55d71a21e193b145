//! Error types for event log operations.

/// Error type for store operations.
///
/// `Unavailable` is transient: callers may retry with backoff. `Gone` is
/// terminal: the collection or cursor cannot be recovered and the caller
/// must surface the failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store rejected the operation but may accept a retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stream is gone and cannot be reopened.
    #[error("stream gone: {0}")]
    Gone(String),
}

impl StoreError {
    /// Whether a retry of the failed operation can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
