//! Error types for offline-queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is full (max_size={max_size}) and no failed operation can be evicted")]
    QueueFull { max_size: usize },

    #[error("queue is closed")]
    Closed,

    #[error("processing run aborted: {0}")]
    RunAborted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
