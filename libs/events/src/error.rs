//! Error types for event decoding.

use thiserror::Error;

/// Errors that can occur when decoding agent-originated payloads.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The payload did not decode as any known event shape. This is the
    /// `INVALID_REQUEST` boundary rejection.
    #[error("malformed event payload: {0}")]
    Malformed(String),

    /// Serialization error on the outbound path.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Malformed(err.to_string())
    }
}
