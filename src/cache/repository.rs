use super::{CacheError, CacheStore};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a value returned by [`CacheBackedRepository::get_or_recover`] came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Cached(T),
    Recovered(T),
}

impl<T> Fetched<T> {
    pub fn into_inner(self) -> T {
        match self {
            Fetched::Cached(value) | Fetched::Recovered(value) => value,
        }
    }

    pub fn was_recovered(&self) -> bool {
        matches!(self, Fetched::Recovered(_))
    }
}

/// Cache-first access to values that also have a durable copy.
///
/// A cache miss (or an unavailable cache) runs the caller's recovery
/// strategy against the durable store and re-seeds the cache with whatever
/// it finds.
pub struct CacheBackedRepository<T> {
    cache: CacheStore,
    reseed_ttl: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for CacheBackedRepository<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            reseed_ttl: self.reseed_ttl,
            _marker: PhantomData,
        }
    }
}

impl<T> CacheBackedRepository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(cache: CacheStore, reseed_ttl: Duration) -> Self {
        Self {
            cache,
            reseed_ttl,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.cache.get(key).await
    }

    pub async fn put(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        self.cache.set(key, value, Some(ttl)).await
    }

    pub async fn get_or_recover<F, Fut, E>(
        &self,
        key: &str,
        recover: F,
    ) -> Result<Option<Fetched<T>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        match self.cache.get::<T>(key).await {
            Ok(Some(value)) => return Ok(Some(Fetched::Cached(value))),
            Ok(None) => debug!(key, "Cache miss, trying durable store"),
            Err(e) => warn!(key, error = %e, "Cache read failed, trying durable store"),
        }

        let Some(value) = recover().await? else {
            return Ok(None);
        };

        if let Err(e) = self.cache.set(key, &value, Some(self.reseed_ttl)).await {
            warn!(key, error = %e, "Failed to re-seed cache after recovery");
        }

        Ok(Some(Fetched::Recovered(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::sync::Arc;

    fn repo() -> CacheBackedRepository<String> {
        let store = CacheStore::new(Arc::new(InMemoryCache::new()));
        CacheBackedRepository::new(store, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn cached_value_skips_recovery() {
        let repo = repo();
        repo.put("k", &"cached".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let fetched = repo
            .get_or_recover("k", || async {
                Err::<Option<String>, _>("recovery must not run")
            })
            .await
            .unwrap();

        assert_eq!(fetched, Some(Fetched::Cached("cached".to_string())));
    }

    #[tokio::test]
    async fn miss_recovers_and_reseeds() {
        let repo = repo();

        let fetched = repo
            .get_or_recover::<_, _, ()>("k", || async { Ok(Some("durable".to_string())) })
            .await
            .unwrap()
            .unwrap();

        assert!(fetched.was_recovered());
        assert_eq!(repo.get("k").await.unwrap().as_deref(), Some("durable"));
    }

    #[tokio::test]
    async fn miss_without_durable_copy_is_none() {
        let repo = repo();

        let fetched = repo
            .get_or_recover::<_, _, ()>("k", || async { Ok(None) })
            .await
            .unwrap();

        assert!(fetched.is_none());
        assert_eq!(repo.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recovery_errors_propagate() {
        let repo = repo();

        let result = repo
            .get_or_recover("k", || async { Err::<Option<String>, _>("db down") })
            .await;

        assert_eq!(result, Err("db down"));
    }
}
