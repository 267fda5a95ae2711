//! Cache error types

use std::time::Duration;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Key ({key}) could not be encoded into a valid key of at most {max_len} characters")]
    InvalidKey { key: String, max_len: usize },

    #[error("Unsupported value {found} for clear generation at key {key}")]
    CorruptGeneration { key: String, found: String },

    #[error("Timed out after {waited:?} acquiring {kind} lock for key {key}")]
    AcquireTimeout {
        key: String,
        kind: &'static str,
        waited: Duration,
    },

    #[error("Region {0} does not support clearing")]
    ClearUnsupported(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// Wrap a transport failure message from a store adapter.
    pub fn backend(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        CacheError::Backend(msg.into())
    }
}
