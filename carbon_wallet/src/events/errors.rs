//! Event bus error types.

use thiserror::Error;

/// Event bus errors
#[derive(Debug, Error)]
pub enum EventError {
    /// Envelope or payload could not be encoded or decoded
    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope carries a different event type than the caller asked for
    #[error("Unexpected event type: expected {expected}, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },

    /// Bus rejected or lost the event
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Bus connection error
    #[error("Bus database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for event operations
pub type EventResult<T> = Result<T, EventError>;
