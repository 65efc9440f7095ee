//! Error types for taskq.
//!
//! Creation-time validation failures are not errors; see
//! [`CreateResult`](crate::model::CreateResult). Lost claim races never
//! leave the claim engine. What remains here are protocol violations,
//! which callers must handle, and infrastructure failures.

use thiserror::Error;

use crate::model::{Status, TaskId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The reporting worker no longer owns the claim.
    #[error("claim token mismatch for task {task_id}")]
    TokenMismatch { task_id: TaskId },

    /// The task was not executing when the result arrived.
    #[error("task {task_id} is {status}, not executing")]
    NotExecuting { task_id: TaskId, status: Status },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the caller broke the claim protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::TokenMismatch { .. } | Error::NotExecuting { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
