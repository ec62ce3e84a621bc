use super::{CacheBackend, CacheError};
use crate::middleware_helpers::retry::{with_retry, RetryConfig, RetryPolicy};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Retries backend failures; serialization problems fail straight away.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheRetryPolicy;

impl RetryPolicy<CacheError> for CacheRetryPolicy {
    fn is_retryable(&self, error: &CacheError) -> bool {
        error.is_transient()
    }
}

/// The only way the rest of the crate talks to the cache.
///
/// Every call goes through [`with_retry`] (3 attempts, fixed 1s delay by
/// default). When the budget is exhausted the caller gets
/// [`CacheError::Unavailable`]. Values are stored as JSON.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    retry: RetryConfig,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_retry_config(backend, RetryConfig::fixed(3, Duration::from_secs(1)))
    }

    pub fn with_retry_config(backend: Arc<dyn CacheBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let raw = self
            .retrying("cache.get", || self.backend.get(key))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.retrying("cache.set", || self.backend.set(key, &raw, ttl))
            .await
    }

    #[instrument(skip(self))]
    pub async fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.retrying("cache.del", || self.backend.delete(key)).await
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.retrying("cache.exists", || self.backend.exists(key))
            .await
    }

    #[instrument(skip(self))]
    pub async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.retrying("cache.ttl", || self.backend.ttl(key)).await
    }

    #[instrument(skip(self))]
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.retrying("cache.keys", || self.backend.keys(pattern))
            .await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CacheError>>,
    {
        with_retry(operation, &self.retry, &CacheRetryPolicy, op)
            .await
            .map_err(|exhausted| {
                if exhausted.error.is_transient() {
                    CacheError::Unavailable {
                        attempts: exhausted.attempts,
                        source: Box::new(exhausted.error),
                    }
                } else {
                    exhausted.error
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use assert_matches::assert_matches;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls to `get`, then delegates.
    struct FlakyCache {
        inner: InMemoryCache,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl CacheBackend for FlakyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(CacheError::Backend("connection reset".into()));
            }
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.exists(key).await
        }
        async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
            self.inner.ttl(key).await
        }
        async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
            self.inner.keys(pattern).await
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn flaky(failures: u32) -> (Arc<FlakyCache>, CacheStore) {
        let backend = Arc::new(FlakyCache {
            inner: InMemoryCache::new(),
            failures,
            calls: AtomicU32::new(0),
        });
        let store = CacheStore::with_retry_config(
            backend.clone(),
            RetryConfig::fixed(3, Duration::ZERO),
        );
        (backend, store)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
    }

    #[tokio::test]
    async fn typed_values_round_trip_through_json() {
        let store = CacheStore::new(Arc::new(InMemoryCache::new()));
        let cart = Cart {
            items: vec!["c1".into()],
        };
        store.set("cart:u1", &cart, None).await.unwrap();

        assert_eq!(store.get::<Cart>("cart:u1").await.unwrap(), Some(cart));
        assert_eq!(store.get::<Cart>("cart:u2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recovers_when_a_retry_succeeds() {
        let (backend, store) = flaky(2);
        store.set("k", &1u32, None).await.unwrap();

        assert_eq!(store.get::<u32>("k").await.unwrap(), Some(1));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_unavailable_after_three_attempts() {
        let (backend, store) = flaky(10);

        let err = store.get::<u32>("k").await.unwrap_err();
        assert_matches!(err, CacheError::Unavailable { attempts: 3, .. });
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn corrupt_payload_is_not_retried() {
        let backend = Arc::new(InMemoryCache::new());
        backend.set("k", "not json", None).await.unwrap();
        let store = CacheStore::with_retry_config(backend, RetryConfig::fixed(3, Duration::ZERO));

        assert_matches!(
            store.get::<u32>("k").await,
            Err(CacheError::Serialization(_))
        );
    }
}
