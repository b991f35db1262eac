//! Application error type mapping engine and repository errors to HTTP
//! status codes in the envelope format.

use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use bioflow_core::execution::engine::ExecutorError;
use bioflow_types::error::RepositoryError;

use super::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Resource does not exist (404).
    NotFound(String),
    /// Operation conflicts with current state, e.g. deleting a
    /// non-terminal run (409).
    Conflict(String),
    /// Malformed request or invalid workflow document (400).
    Validation(String),
    /// Anything else (500).
    Internal(String),
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(msg) => AppError::NotFound(msg),
            RepositoryError::Conflict(msg) => AppError::Conflict(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ExecutorError> for AppError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::RunNotFound(id) => AppError::NotFound(format!("run {id} not found")),
            ExecutorError::Workflow(err) => AppError::Validation(err.to_string()),
            ExecutorError::InvalidState { run_id, reason } => {
                AppError::Conflict(format!("run {run_id}: {reason}"))
            }
            ExecutorError::Repository(err) => AppError::from(err),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            AppError::NotFound(msg) => ("NOT_FOUND", msg),
            AppError::Conflict(msg) => ("CONFLICT", msg),
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg),
            AppError::Internal(msg) => ("INTERNAL_ERROR", msg),
        };
        ApiResponse::error(code, &message, Uuid::now_v7().to_string()).into_response()
    }
}
