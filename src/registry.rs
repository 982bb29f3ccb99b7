use crate::cache::{CacheStatsSnapshot, InstanceCache};
use crate::core::{CacheError, Result};
use crate::factory::InstanceFactory;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// A cache as seen by the registry: named, startable, observable.
///
/// Implemented by [`InstanceCache`] for every factory type, so caches with
/// different state types can live in one registry.
#[async_trait]
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn stats(&self) -> CacheStatsSnapshot;
}

#[async_trait]
impl<F: InstanceFactory> ManagedCache for InstanceCache<F> {
    fn name(&self) -> &str {
        InstanceCache::name(self)
    }

    async fn start(&self) -> Result<()> {
        InstanceCache::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        InstanceCache::stop(self).await
    }

    async fn stats(&self) -> CacheStatsSnapshot {
        InstanceCache::stats(self).await
    }
}

/// Explicit registry of caches with a shared startup and shutdown lifecycle.
///
/// Passed to the components that need it at construction time; there is no
/// process-global instance.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<Vec<Arc<dyn ManagedCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache under its configured name.
    ///
    /// Names are unique within a registry; a duplicate is rejected.
    pub async fn register(&self, cache: Arc<dyn ManagedCache>) -> Result<()> {
        let mut caches = self.caches.lock().await;
        if caches.iter().any(|existing| existing.name() == cache.name()) {
            return Err(CacheError::Config(format!(
                "cache '{}' is already registered",
                cache.name()
            )));
        }
        event!(Level::DEBUG, cache = %cache.name(), "cache registered");
        caches.push(cache);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        self.caches
            .lock()
            .await
            .iter()
            .find(|cache| cache.name() == name)
            .cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.caches
            .lock()
            .await
            .iter()
            .map(|cache| cache.name().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.caches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.caches.lock().await.is_empty()
    }

    /// Start every registered cache in registration order.
    ///
    /// Stops at the first failure; already started caches stay up.
    pub async fn start_all(&self) -> Result<()> {
        let caches = self.caches.lock().await.clone();
        for cache in caches {
            cache.start().await?;
        }
        Ok(())
    }

    /// Stop every registered cache, in reverse registration order.
    ///
    /// Failures are logged and the shutdown continues; the first error is
    /// returned once every cache has been told to stop.
    pub async fn stop_all(&self) -> Result<()> {
        let caches = self.caches.lock().await.clone();
        let mut first_error = None;
        for cache in caches.iter().rev() {
            if let Err(err) = cache.stop().await {
                event!(Level::WARN, cache = %cache.name(), error = %err, "cache stop failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
