//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when encoding or decoding events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The run status string is not recognized.
    #[error("unknown run status: {0}")]
    UnknownRunStatus(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
