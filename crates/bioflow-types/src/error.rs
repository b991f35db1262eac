//! Shared error types.

use thiserror::Error;

/// Errors surfaced by repository implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the record's current state
    /// (e.g. deleting a run that is not terminal).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A query failed or returned malformed data.
    #[error("query error: {0}")]
    Query(String),

    /// The underlying database driver reported an error.
    #[error("database error: {0}")]
    Database(String),
}
