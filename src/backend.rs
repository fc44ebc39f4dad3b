use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;

use crate::{
    config::FeedCacheConfig,
    error::BackendError,
    keys::{CacheKey, ScopeIdentity},
    types::FeedPage,
};

/// Storage behind the feed cache.
///
/// Errors mean the store itself is unreachable; callers degrade to
/// computing pages directly.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<FeedPage>>, BackendError>;

    async fn put(&self, key: CacheKey, page: Arc<FeedPage>) -> Result<(), BackendError>;

    /// Drop every stored page whose scope depends on `identity`.
    async fn evict(&self, identity: &ScopeIdentity) -> Result<(), BackendError>;

    fn entry_count(&self) -> u64;

    async fn run_maintenance(&self) {}
}

/// In-process backend. Entries expire `ttl_seconds` after they are written.
pub struct MokaBackend {
    pages: Cache<CacheKey, Arc<FeedPage>>,
}

impl MokaBackend {
    pub fn new(config: &FeedCacheConfig) -> Self {
        let pages = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.ttl())
            .support_invalidation_closures()
            .build();
        Self { pages }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<FeedPage>>, BackendError> {
        Ok(self.pages.get(key).await)
    }

    async fn put(&self, key: CacheKey, page: Arc<FeedPage>) -> Result<(), BackendError> {
        self.pages.insert(key, page).await;
        Ok(())
    }

    async fn evict(&self, identity: &ScopeIdentity) -> Result<(), BackendError> {
        let identity = *identity;
        self.pages
            .invalidate_entries_if(move |key, _| key.depends_on(&identity))
            .map(|_| ())
            .map_err(|e| BackendError(format!("failed to register eviction: {}", e)))
    }

    fn entry_count(&self) -> u64 {
        self.pages.entry_count()
    }

    async fn run_maintenance(&self) {
        self.pages.run_pending_tasks().await;
    }
}
