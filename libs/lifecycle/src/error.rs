//! The orchestrator error taxonomy.
//!
//! These codes cross the boundary to callers (the API layer maps them to
//! HTTP responses) and are recorded on tasks that end abnormally, so they
//! live next to the transition logic that produces them.

use serde::{Deserialize, Serialize};

/// Stable error codes surfaced past the orchestrator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The inbound request was malformed and rejected before reaching any
    /// state machine.
    InvalidRequest,

    /// A referenced entity does not exist.
    UnableToFind,

    /// The worker process exited unsuccessfully or never started.
    TaskFailed,

    /// A version-conditioned write kept conflicting past the retry budget.
    UnableToUpdate,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnableToFind => "UNABLE_TO_FIND",
            ErrorCode::TaskFailed => "TASK_FAILED",
            ErrorCode::UnableToUpdate => "UNABLE_TO_UPDATE",
        };
        write!(f, "{}", s)
    }
}

/// The terminal error recorded on a task that ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub errors: Vec<String>,
}

impl TaskError {
    /// Creates a task error with a single message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            errors: vec![message.into()],
        }
    }

    /// Appends a detail message (e.g. captured stderr).
    pub fn push_detail(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::TaskFailed).unwrap();
        assert_eq!(json, r#""TASK_FAILED""#);
        let json = serde_json::to_string(&ErrorCode::UnableToFind).unwrap();
        assert_eq!(json, r#""UNABLE_TO_FIND""#);
    }

    #[test]
    fn test_task_error_display() {
        let mut err = TaskError::new(ErrorCode::TaskFailed, "task reported unsuccessful exit");
        err.push_detail("stderr: segfault");
        assert_eq!(
            err.to_string(),
            "TASK_FAILED: task reported unsuccessful exit; stderr: segfault"
        );
    }
}
