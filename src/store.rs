use anyhow::Result;
use async_trait::async_trait;

use crate::types::{FeedPage, PageRequest, Post, PostId, UserId};

/// Source of truth for posts visible to a viewer.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Newest-first page for the request's scope, with blocked authors removed.
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage>;

    /// Load full posts for the given ids. Missing ids are skipped; order is unspecified.
    async fn hydrate(&self, ids: &[PostId]) -> Result<Vec<Post>>;
}

/// Stores that know the follow graph can fan a new post out to followers' timelines.
#[async_trait]
pub trait FollowGraph: Send + Sync {
    async fn followers_of(&self, user: UserId) -> Result<Vec<UserId>>;
}
