use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::{
    error::FeedError,
    feed_cache::FeedCache,
    pagination::{self, Envelope},
    store::PostStore,
    types::{FeedPage, FeedScope, PageRequest, Post, PostId, PostRef},
};

/// Query parameter that carries the page number.
pub const PAGE_NAME: &str = "page";

/// Cached, hydrated feed pages for the HTTP layer.
pub struct FeedService {
    cache: Arc<FeedCache>,
    store: Arc<dyn PostStore>,
}

impl FeedService {
    pub fn new(cache: Arc<FeedCache>, store: Arc<dyn PostStore>) -> Self {
        Self { cache, store }
    }

    /// Build a request at the configured page size; a missing page means page 1.
    pub fn page_request(
        &self,
        scope: FeedScope,
        page: Option<i64>,
        filters: &[&str],
    ) -> Result<PageRequest, FeedError> {
        let per_page = i64::from(self.cache.config().default_per_page);
        Ok(PageRequest::new(scope, page.unwrap_or(1), per_page)?.with_filters(filters))
    }

    pub async fn page(&self, request: &PageRequest) -> Result<Envelope<Post>, FeedError> {
        let page = self
            .cache
            .get_or_compute(request, || self.store.fetch_page(request))
            .await?;
        self.hydrate(pagination::build(&page, PAGE_NAME)).await
    }

    /// Like [`FeedService::page`] but skips the cached copy, for a viewer
    /// who must see their own write immediately.
    pub async fn fresh_page(&self, request: &PageRequest) -> Result<Envelope<Post>, FeedError> {
        let page = self
            .cache
            .get_fresh(request, || self.store.fetch_page(request))
            .await?;
        self.hydrate(pagination::build(&page, PAGE_NAME)).await
    }

    /// The envelope rendered when a feed could not be produced.
    pub fn empty_page(&self, request: &PageRequest) -> Envelope<Post> {
        pagination::build(&FeedPage::empty(request), PAGE_NAME).map_data(|_| Vec::new())
    }

    async fn hydrate(
        &self,
        envelope: Envelope<PostRef>,
    ) -> Result<Envelope<Post>, FeedError> {
        let ids: Vec<PostId> = envelope.data.iter().map(|item| item.id).collect();
        let mut posts: HashMap<PostId, Post> = self
            .store
            .hydrate(&ids)
            .await
            .map_err(FeedError::hydration)?
            .into_iter()
            .map(|post| (post.id, post))
            .collect();

        if posts.len() < ids.len() {
            debug!(
                requested = ids.len(),
                found = posts.len(),
                "Some cached posts no longer exist"
            );
        }

        Ok(envelope.map_data(|items| {
            items
                .into_iter()
                .filter_map(|item| posts.remove(&item.id))
                .collect()
        }))
    }
}
