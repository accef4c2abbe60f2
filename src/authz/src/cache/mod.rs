//! Cache layer for resolved roles, organization context and role closures
//!
//! Values are stored as JSON so any [`CacheService`] backend (in-process or
//! remote) can hold them. A value that fails to decode is treated as a miss.

pub mod memory;

pub use memory::{CacheConfig, CacheStats, InMemoryCache};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Cache backend failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid key pattern '{0}'")]
    InvalidPattern(String),
}

/// Key-value cache with per-entry TTL
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Store `value` for `ttl_secs` seconds. A TTL of zero never expires.
    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Keys matching a glob pattern where `*` matches any run of characters
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

/// Cache that stores nothing: every read misses, every write succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheService for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Value, _ttl_secs: u64) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
        Ok(Vec::new())
    }
}

/// Typed read. Undecodable entries count as a miss.
pub async fn get_json<T>(cache: &dyn CacheService, key: &str) -> Result<Option<T>, CacheError>
where
    T: DeserializeOwned,
{
    let Some(value) = cache.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_value(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(e) => {
            warn!(key = %key, "Discarding corrupt cache entry: {}", e);
            Ok(None)
        }
    }
}

/// Typed write
pub async fn set_json<T>(
    cache: &dyn CacheService,
    key: &str,
    value: &T,
    ttl_secs: u64,
) -> Result<(), CacheError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value)?;
    cache.set(key, value, ttl_secs).await
}

/// Translate a `*` glob into an anchored regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex, CacheError> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    regex::Regex::new(&format!("^{}$", escaped))
        .map_err(|_| CacheError::InvalidPattern(pattern.to_string()))
}
