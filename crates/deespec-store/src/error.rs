use thiserror::Error;

use crate::models::TaskId;

/// Errors surfaced by any repository implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("invalid enum value: {0}")]
    InvalidEnum(#[from] crate::models::ParseEnumError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

pub type StoreResult<T> = Result<T, StoreError>;
