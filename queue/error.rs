use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error(transparent)]
    StorageError(#[from] mxrmq_storage::Error),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Topic name may not be empty")]
    EmptyTopic,

    #[error("No handler registered for any topic")]
    NoHandlers,

    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Corrupt envelope for message {id}: {reason}")]
    CorruptEnvelope { id: String, reason: String },

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}
