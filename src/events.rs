use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    database::Database,
    feed_cache::FeedCache,
    keys::ScopeIdentity,
    store::FollowGraph,
    types::{NewPost, PostId, UserId},
};

/// A write that changes what some feed should show.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    PostPublished {
        author_id: UserId,
        body: String,
        #[serde(default)]
        repost_of: Option<PostId>,
        #[serde(default)]
        created_at: Option<DateTime<Utc>>,
    },
    PostDeleted {
        post_id: PostId,
    },
    Followed {
        follower_id: UserId,
        target_id: UserId,
    },
    Unfollowed {
        follower_id: UserId,
        target_id: UserId,
    },
    Blocked {
        blocker_id: UserId,
        blocked_id: UserId,
    },
    Unblocked {
        blocker_id: UserId,
        blocked_id: UserId,
    },
}

/// Applies feed events to the database, then invalidates the affected feeds.
#[derive(Clone)]
pub struct FeedEventHandler {
    db: Arc<Database>,
    cache: Arc<FeedCache>,
}

impl FeedEventHandler {
    pub fn new(db: Arc<Database>, cache: Arc<FeedCache>) -> Self {
        Self { db, cache }
    }

    /// Returns the identities whose cached feeds were invalidated.
    pub async fn handle(&self, event: FeedEvent) -> Result<Vec<ScopeIdentity>> {
        let affected = match event {
            FeedEvent::PostPublished {
                author_id,
                body,
                repost_of,
                created_at,
            } => {
                let post = NewPost {
                    author_id,
                    body,
                    repost_of,
                    created_at: created_at.unwrap_or_else(Utc::now),
                };
                let id = self.db.insert_post(&post).await?;
                info!(post_id = %id, author = %author_id, "Post published");
                self.post_audience(author_id).await?
            }
            FeedEvent::PostDeleted { post_id } => match self.db.delete_post(post_id).await? {
                Some(author_id) => self.post_audience(author_id).await?,
                None => Vec::new(),
            },
            FeedEvent::Followed {
                follower_id,
                target_id,
            } => {
                self.db.insert_follow(follower_id, target_id).await?;
                vec![ScopeIdentity::Viewer(follower_id)]
            }
            FeedEvent::Unfollowed {
                follower_id,
                target_id,
            } => {
                self.db.delete_follow(follower_id, target_id).await?;
                vec![ScopeIdentity::Viewer(follower_id)]
            }
            FeedEvent::Blocked {
                blocker_id,
                blocked_id,
            } => {
                self.db.insert_block(blocker_id, blocked_id).await?;
                vec![
                    ScopeIdentity::Viewer(blocker_id),
                    ScopeIdentity::Viewer(blocked_id),
                ]
            }
            FeedEvent::Unblocked {
                blocker_id,
                blocked_id,
            } => {
                self.db.delete_block(blocker_id, blocked_id).await?;
                vec![
                    ScopeIdentity::Viewer(blocker_id),
                    ScopeIdentity::Viewer(blocked_id),
                ]
            }
        };

        for identity in &affected {
            // The write already happened; a failed eviction only leaves pages
            // stale until their TTL runs out.
            if let Err(e) = self.cache.invalidate(identity).await {
                warn!(identity = %identity, error = %e, "Failed to invalidate feed");
            }
        }
        Ok(affected)
    }

    /// The author's profile plus the home timelines that include the author.
    async fn post_audience(&self, author: UserId) -> Result<Vec<ScopeIdentity>> {
        let followers = self.db.followers_of(author).await?;
        let mut affected = Vec::with_capacity(followers.len() + 2);
        affected.push(ScopeIdentity::Author(author));
        affected.push(ScopeIdentity::Viewer(author));
        affected.extend(followers.into_iter().map(ScopeIdentity::Viewer));
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedCacheConfig, InvalidationStrategy};
    use crate::database::tests::{seed_posts, test_db};
    use crate::feed_service::FeedService;
    use crate::store::PostStore;
    use crate::types::FeedScope;

    async fn setup(
        strategy: InvalidationStrategy,
    ) -> Result<(FeedEventHandler, FeedService, Arc<Database>)> {
        let db = Arc::new(test_db().await?);
        let cache = Arc::new(FeedCache::new(FeedCacheConfig {
            invalidation_strategy: strategy,
            ..Default::default()
        }));
        let handler = FeedEventHandler::new(Arc::clone(&db), Arc::clone(&cache));
        let store: Arc<dyn PostStore> = db.clone();
        let service = FeedService::new(cache, store);
        Ok((handler, service, db))
    }

    #[test]
    fn deserializes_tagged_events() {
        let event: FeedEvent = serde_json::from_str(
            r#"{"type":"post_published","author_id":4,"body":"hi"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            FeedEvent::PostPublished {
                author_id: UserId(4),
                body: "hi".to_string(),
                repost_of: None,
                created_at: None,
            }
        );

        let event: FeedEvent =
            serde_json::from_str(r#"{"type":"blocked","blocker_id":1,"blocked_id":2}"#).unwrap();
        assert!(matches!(event, FeedEvent::Blocked { .. }));
    }

    #[tokio::test]
    async fn new_post_reaches_profile_and_follower_timelines() -> Result<()> {
        for strategy in [InvalidationStrategy::Generation, InvalidationStrategy::Explicit] {
            let (handler, service, db) = setup(strategy).await?;
            let (author, follower) = (UserId(1), UserId(2));
            seed_posts(&db, author, 2).await?;
            handler
                .handle(FeedEvent::Followed {
                    follower_id: follower,
                    target_id: author,
                })
                .await?;

            let profile = service.page_request(FeedScope::author(author, Some(author)), None, &[])?;
            let home = service.page_request(FeedScope::following(Some(follower)), None, &[])?;
            assert_eq!(service.page(&profile).await?.data.len(), 2);
            assert_eq!(service.page(&home).await?.data.len(), 2);

            let affected = handler
                .handle(FeedEvent::PostPublished {
                    author_id: author,
                    body: "breaking".to_string(),
                    repost_of: None,
                    created_at: None,
                })
                .await?;
            assert!(affected.contains(&ScopeIdentity::Viewer(follower)));

            assert_eq!(service.page(&profile).await?.data[0].body, "breaking");
            assert_eq!(service.page(&home).await?.data[0].body, "breaking");
        }
        Ok(())
    }

    #[tokio::test]
    async fn block_is_reflected_without_waiting_for_ttl() -> Result<()> {
        let (handler, service, db) = setup(InvalidationStrategy::Explicit).await?;
        let (viewer, author) = (UserId(1), UserId(2));
        seed_posts(&db, author, 3).await?;
        handler
            .handle(FeedEvent::Followed {
                follower_id: viewer,
                target_id: author,
            })
            .await?;

        let profile = service.page_request(FeedScope::author(author, Some(viewer)), None, &[])?;
        assert_eq!(service.page(&profile).await?.meta.total, 3);

        handler
            .handle(FeedEvent::Blocked {
                blocker_id: author,
                blocked_id: viewer,
            })
            .await?;
        assert_eq!(service.page(&profile).await?.meta.total, 0);

        handler
            .handle(FeedEvent::Unblocked {
                blocker_id: author,
                blocked_id: viewer,
            })
            .await?;
        assert_eq!(service.page(&profile).await?.meta.total, 3);
        Ok(())
    }

    #[tokio::test]
    async fn unfollow_empties_home_timeline() -> Result<()> {
        let (handler, service, db) = setup(InvalidationStrategy::Generation).await?;
        let (viewer, author) = (UserId(1), UserId(2));
        seed_posts(&db, author, 1).await?;
        handler
            .handle(FeedEvent::Followed {
                follower_id: viewer,
                target_id: author,
            })
            .await?;

        let home = service.page_request(FeedScope::following(Some(viewer)), None, &[])?;
        assert_eq!(service.page(&home).await?.data.len(), 1);

        handler
            .handle(FeedEvent::Unfollowed {
                follower_id: viewer,
                target_id: author,
            })
            .await?;
        assert!(service.page(&home).await?.data.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_missing_post_invalidates_nothing() -> Result<()> {
        let (handler, _, _) = setup(InvalidationStrategy::Generation).await?;
        let affected = handler
            .handle(FeedEvent::PostDeleted { post_id: PostId(42) })
            .await?;
        assert!(affected.is_empty());
        Ok(())
    }
}
