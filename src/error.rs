//! Structured errors for client-facing operations.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    InvalidInput,
    InvalidState,
    UnknownUpstream,

    // Not found errors
    AttemptNotFound,
    TaskNotFound,
    QueueNotFound,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// Error returned to clients of the engine (CLI, embedding services).
#[derive(Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, reason)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, reason)
    }

    pub fn unknown_upstream(task: &str, key: &str) -> Self {
        Self::new(
            ErrorCode::UnknownUpstream,
            format!("Task {} depends on unknown sibling {}", task, key),
        )
    }

    pub fn attempt_not_found(attempt_id: i64) -> Self {
        Self::new(
            ErrorCode::AttemptNotFound,
            format!("Attempt not found: {}", attempt_id),
        )
    }

    pub fn task_not_found(task_id: i64) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("Task not found: {}", task_id))
    }

    pub fn queue_not_found(name: &str) -> Self {
        Self::new(ErrorCode::QueueNotFound, format!("Queue not found: {}", name))
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

// Store functions return anyhow; recover the structured error when there is one.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(sql_err) => EngineError::database(sql_err),
                Err(err) => EngineError::internal(err),
            },
        }
    }
}

/// Result type for client-facing operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
