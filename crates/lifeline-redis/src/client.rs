//! Redis connection management.

use lifeline_core::StoreError;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Redis error types.
#[derive(Error, Debug)]
pub enum RedisStoreError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt document at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Document at {key} changed since it was read")]
    Conflict { key: String },
}

/// Result type for Redis operations.
pub type RedisResult<T> = Result<T, RedisStoreError>;

impl From<RedisStoreError> for StoreError {
    fn from(err: RedisStoreError) -> Self {
        match err {
            RedisStoreError::Connection(e)
                if e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout() =>
            {
                StoreError::Unavailable(e.to_string())
            }
            RedisStoreError::Connection(e) => StoreError::Query(e.to_string()),
            RedisStoreError::Serialization(e) => StoreError::Serialization(e.to_string()),
            RedisStoreError::Corrupt { .. } => StoreError::Serialization(err.to_string()),
            RedisStoreError::Conflict { .. } => StoreError::Conflict(err.to_string()),
        }
    }
}

/// Redis connection pool. ConnectionManager multiplexes and reconnects
/// internally; clone it to get a mutable handle for each operation.
pub type RedisPool = ConnectionManager;

/// `[redis]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every key this store writes.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "lifeline".to_string(),
        }
    }
}

impl RedisConfig {
    /// Override the URL from `REDIS_URL` when it is set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.url = url;
            }
        }
    }
}

/// Initialize a Redis connection pool from a URL.
///
/// Example URL: `redis://127.0.0.1:6379`
pub async fn init_pool(redis_url: &str) -> RedisResult<RedisPool> {
    let client = redis::Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;
    Ok(manager)
}
