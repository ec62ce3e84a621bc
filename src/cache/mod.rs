//! Volatile key-value store used for carts, order records and payment
//! linkage. Redis in production, with an in-process fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod redis_cache;
pub mod repository;
pub mod store;

pub use redis_cache::RedisCache;
pub use repository::CacheBackedRepository;
pub use store::CacheStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Cache unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Backend failures are worth retrying; bad payloads are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Backend(_))
    }
}

/// TTL reported for a key that exists without expiry.
pub const TTL_PERSISTENT: i64 = -1;
/// TTL reported for a key that does not exist.
pub const TTL_MISSING: i64 = -2;

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    /// Returns true when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    /// Remaining lifetime in seconds, [`TTL_PERSISTENT`] or [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> Result<i64, CacheError>;
    /// Keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

// In-memory cache implementation as fallback
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn purge_expired(&self, key: &str) {
        let mut store = self.store.write().await;
        if store.get(key).map(CacheEntry::is_expired).unwrap_or(false) {
            store.remove(key);
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.purge_expired(key).await;
        let store = self.store.read().await;
        Ok(store.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        store.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut store = self.store.write().await;
        Ok(store
            .remove(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.purge_expired(key).await;
        Ok(self.store.read().await.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.purge_expired(key).await;
        let store = self.store.read().await;
        Ok(match store.get(key) {
            None => TTL_MISSING,
            Some(CacheEntry {
                expires_at: None, ..
            }) => TTL_PERSISTENT,
            Some(CacheEntry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let store = self.store.read().await;
        let mut keys: Vec<String> = store
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Redis-style glob matching restricted to `*` and `?`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((star_pi, star_ci)) = star {
            pi = star_pi + 1;
            ci = star_ci + 1;
            star = Some((star_pi, star_ci + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|ch| *ch == '*')
}

/// Which backend to construct at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackendKind {
    Redis,
    InMemory,
}

// Cache factory
pub struct CacheFactory;

impl CacheFactory {
    pub async fn create_cache(
        kind: CacheBackendKind,
        redis_url: &str,
    ) -> Result<Arc<dyn CacheBackend>, CacheError> {
        match kind {
            CacheBackendKind::InMemory => Ok(Arc::new(InMemoryCache::new())),
            CacheBackendKind::Redis => match RedisCache::connect(redis_url).await {
                Ok(cache) => Ok(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to connect to Redis, falling back to in-memory cache");
                    Ok(Arc::new(InMemoryCache::new()))
                }
            },
        }
    }
}
