use std::fmt;

/// Error types for retryq operations
#[derive(Debug)]
pub enum Error {
    /// Redis connection or operation errors
    Redis(redis::RedisError),
    /// JSON serialization/deserialization errors
    Serialization(serde_json::Error),
    /// Configuration or invalid argument errors
    Config(String),
    /// Job processing errors
    JobProcessing(String),
    /// Worker errors
    Worker(String),
    /// Connection errors
    Connection(String),
    /// A stored record could not be decoded
    CorruptRecord(String),
    /// An idempotency key was reused with a different request body
    Conflict { key: String },
    /// An idempotency key is malformed
    InvalidIdempotencyKey(String),
    /// No live idempotency key exists for a response being stored
    UnknownIdempotencyKey(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Redis(e) => write!(f, "Redis error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::JobProcessing(msg) => write!(f, "Job processing error: {}", msg),
            Error::Worker(msg) => write!(f, "Worker error: {}", msg),
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::CorruptRecord(msg) => write!(f, "Corrupt record: {}", msg),
            Error::Conflict { key } => write!(
                f,
                "Idempotency conflict: key '{}' was already used with a different request",
                key
            ),
            Error::InvalidIdempotencyKey(msg) => write!(f, "Invalid idempotency key: {}", msg),
            Error::UnknownIdempotencyKey(key) => {
                write!(f, "Unknown or expired idempotency key: {}", key)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Redis(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

/// Result type for retryq operations
pub type Result<T> = std::result::Result<T, Error>;
