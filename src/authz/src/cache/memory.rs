//! In-process TTL cache backed by DashMap

use super::{glob_to_regex, CacheError, CacheService};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Cached entry with TTL
#[derive(Clone)]
struct CachedEntry {
    value: Value,
    cached_at: Instant,
    ttl: Option<Duration>,
}

impl CachedEntry {
    fn new(value: Value, ttl_secs: u64) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
        }
    }

    fn is_expired(&self) -> bool {
        self.ttl.map_or(false, |ttl| self.cached_at.elapsed() >= ttl)
    }
}

/// In-memory [`CacheService`]
///
/// Each key is updated atomically; expired entries are dropped lazily on read
/// and when the cache reaches capacity.
#[derive(Clone)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    config: CacheConfig,
    stats: Arc<DashMap<String, usize>>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl InMemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
            stats: Arc::new(DashMap::new()),
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.get_stat("hits"),
            misses: self.get_stat("misses"),
            expirations: self.get_stat("expirations"),
            invalidations: self.get_stat("invalidations"),
            entries: self.entries.len(),
            max_entries: self.config.capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.stats.clear();
    }

    /// Make room for one insert: drop expired entries, then the oldest tenth
    fn evict(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
        if self.entries.len() < self.config.capacity {
            return;
        }

        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);

        let to_remove = (self.config.capacity / 10).max(1);
        for (key, _) in by_age.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
        debug!("Evicted {} cache entries", to_remove);
    }

    fn increment_stat(&self, key: &str) {
        self.stats
            .entry(key.to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    fn get_stat(&self, key: &str) -> usize {
        self.stats.get(key).map(|v| *v).unwrap_or(0)
    }
}

#[async_trait]
impl CacheService for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.increment_stat("expirations");
                self.increment_stat("misses");
                return Ok(None);
            }

            self.increment_stat("hits");
            return Ok(Some(entry.value.clone()));
        }

        self.increment_stat("misses");
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<(), CacheError> {
        if !self.entries.contains_key(key) && self.entries.len() >= self.config.capacity {
            self.evict();
        }

        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl_secs));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if self.entries.remove(key).is_some() {
            self.increment_stat("invalidations");
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
    pub invalidations: usize,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
