use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue has been shut down; no further work is accepted.
    #[error("queue.error.queue.closed")]
    QueueClosed,

    /// Attempt cap reached before or after execution.
    #[error("queue.max.execute.attempts")]
    MaxAttemptsExceeded,

    /// A reclaimed job arrived while the previous attempt for the same
    /// job ID is still running in this process.
    #[error("queue.abort.for.waiting.prev.job.finish")]
    AbortForWaitingPrevJobFinish,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Task not bootstrapped: {0}")]
    TaskNotBootstrapped(String),

    #[error("Job execute timeout after {0:?}")]
    Timeout(Duration),

    #[error("Job execute panicked: {0}")]
    Panic(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl From<serde_json::Error> for QueueError {
    fn from(value: serde_json::Error) -> Self {
        QueueError::Codec(value.to_string())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(value: redis::RedisError) -> Self {
        QueueError::Storage(value.to_string())
    }
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(value: deadpool_redis::PoolError) -> Self {
        QueueError::Storage(value.to_string())
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(value: sqlx::Error) -> Self {
        QueueError::Storage(value.to_string())
    }
}
