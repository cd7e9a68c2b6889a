//! Boundary error type for the operations surface.

use fleet_events::EventError;
use fleet_lifecycle::ErrorCode;
use thiserror::Error;

use crate::capacity::CapacityError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// The error shape surfaced to the (external) API layer: a stable code
/// plus a human-readable message. The API layer maps `InvalidRequest` and
/// `UnableToFind` to 400-class responses.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unable_to_find(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnableToFind, message)
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        ApiError::invalid_request(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound { .. } => ErrorCode::UnableToFind,
            StoreError::AlreadyExists { .. } => ErrorCode::InvalidRequest,
            // Conflicts that escape the retry loops, and backend failures,
            // both read as "try again" to the caller.
            StoreError::Conflict { .. }
            | StoreError::Serialization(_)
            | StoreError::Database(_) => ErrorCode::UnableToUpdate,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::new(ErrorCode::UnableToUpdate, err.to_string())
    }
}

impl From<CapacityError> for ApiError {
    fn from(err: CapacityError) -> Self {
        ApiError::new(ErrorCode::UnableToUpdate, err.to_string())
    }
}
