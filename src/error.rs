use thiserror::Error;

#[derive(Error, Debug)]
pub enum MillworkError {
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Queue locked: {queue}")]
    QueueLocked { queue: String },

    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schedule error: {message}")]
    Schedule { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },
}
