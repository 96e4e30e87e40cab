//! Error types for the chat record store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("User '{0}' already exists")]
    DuplicateUser(String),

    #[error("Room '{0}' not found")]
    RoomNotFound(String),

    #[error("Resource queue closed for key '{0}'")]
    QueueClosed(String),

    #[error("Store is shutting down")]
    ShuttingDown,

    #[error("Invalid collection file '{file}': {reason}")]
    InvalidCollection { file: String, reason: String },
}

impl StoreError {
    /// Get error code for the request/transport layer
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::DuplicateUser(_) => "DUPLICATE_USER",
            StoreError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            StoreError::QueueClosed(_) => "QUEUE_CLOSED",
            StoreError::ShuttingDown => "SHUTTING_DOWN",
            _ => "INTERNAL_ERROR",
        }
    }
}
