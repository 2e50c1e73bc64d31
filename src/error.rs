//! Error types for calcq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    /// The receipt handle no longer refers to an in-flight delivery: the item
    /// was already deleted or has been redelivered since it was received.
    #[error("stale receipt handle for message {msg_id} on queue {queue}")]
    StaleHandle { queue: String, msg_id: i64 },

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a failed acknowledgment can be ignored by a consuming loop.
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, Error::StaleHandle { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
