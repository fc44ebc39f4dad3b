use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, QueryBuilder, Row, Sqlite, SqlitePool};

use crate::{
    store::{FollowGraph, PostStore},
    types::{FeedPage, FeedScope, NewPost, PageRequest, Post, PostId, PostRef, UserId},
};

/// Filter token that drops reposts from a feed.
pub const NO_REPOSTS: &str = "no_reposts";

// Hides authors who block the viewer or are blocked by them. Binds the viewer twice.
const VISIBLE_TO_VIEWER: &str = "NOT EXISTS (SELECT 1 FROM blocks b \
     WHERE (b.blocker_id = ? AND b.blocked_id = p.author_id) \
        OR (b.blocker_id = p.author_id AND b.blocked_id = ?))";

const REPOST_FILTER: &str = "(? = 0 OR p.repost_of IS NULL)";

pub struct Database {
    pub pool: SqlitePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub posts: i64,
    pub follows: i64,
    pub blocks: i64,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let pool = SqlitePool::connect(database_url).await?;

        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;

        // Set busy timeout to 5 seconds
        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every pooled connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // Post operations
    pub async fn insert_post(&self, post: &NewPost) -> Result<PostId> {
        let result = sqlx::query(
            r#"
            INSERT INTO posts (author_id, body, repost_of, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(post.author_id.0)
        .bind(&post.body)
        .bind(post.repost_of.map(|id| id.0))
        .bind(format_timestamp(post.created_at))
        .execute(&self.pool)
        .await?;
        Ok(PostId(result.last_insert_rowid()))
    }

    /// Delete a post, returning its author if it existed.
    pub async fn delete_post(&self, id: PostId) -> Result<Option<UserId>> {
        let author: Option<i64> = sqlx::query("SELECT author_id FROM posts WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("author_id"))
            .transpose()?;

        if author.is_some() {
            sqlx::query("DELETE FROM posts WHERE id = ?")
                .bind(id.0)
                .execute(&self.pool)
                .await?;
        }
        Ok(author.map(UserId))
    }

    // Follow operations
    pub async fn insert_follow(&self, follower: UserId, target: UserId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO follows (follower_id, target_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(follower.0)
        .bind(target.0)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_follow(&self, follower: UserId, target: UserId) -> Result<()> {
        sqlx::query("DELETE FROM follows WHERE follower_id = ? AND target_id = ?")
            .bind(follower.0)
            .bind(target.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Block operations. Blocking also severs follows in both directions.
    pub async fn insert_block(&self, blocker: UserId, blocked: UserId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(blocker.0)
        .bind(blocked.0)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM follows
            WHERE (follower_id = ? AND target_id = ?) OR (follower_id = ? AND target_id = ?)
            "#,
        )
        .bind(blocker.0)
        .bind(blocked.0)
        .bind(blocked.0)
        .bind(blocker.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_block(&self, blocker: UserId, blocked: UserId) -> Result<()> {
        sqlx::query("DELETE FROM blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker.0)
            .bind(blocked.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<DatabaseStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM posts) AS posts,
                (SELECT COUNT(*) FROM follows) AS follows,
                (SELECT COUNT(*) FROM blocks) AS blocks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            posts: row.try_get("posts")?,
            follows: row.try_get("follows")?,
            blocks: row.try_get("blocks")?,
        })
    }
}

/// WHERE clause selecting the posts of `request`'s scope, and its bind values in order.
fn feed_filter(request: &PageRequest) -> (String, Vec<Option<i64>>) {
    let viewer = request.scope.viewer().map(|id| id.0);
    let mut binds = Vec::with_capacity(5);

    let scope = match request.scope {
        FeedScope::Following { viewer: Some(viewer) } => {
            binds.extend([Some(viewer.0), Some(viewer.0)]);
            "(p.author_id = ? OR p.author_id IN (SELECT target_id FROM follows WHERE follower_id = ?))"
        }
        FeedScope::Following { viewer: None } => "0 = 1",
        FeedScope::Author { author, .. } => {
            binds.push(Some(author.0));
            "p.author_id = ?"
        }
    };
    binds.extend([viewer, viewer]);
    binds.push(Some(i64::from(request.has_filter(NO_REPOSTS))));

    (
        format!("{} AND {} AND {}", scope, VISIBLE_TO_VIEWER, REPOST_FILTER),
        binds,
    )
}

#[async_trait]
impl PostStore for Database {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage> {
        let (filter, binds) = feed_filter(request);

        let count_sql = format!("SELECT COUNT(*) AS count FROM posts p WHERE {}", filter);
        let mut count_query = sqlx::query(&count_sql);
        for value in &binds {
            count_query = count_query.bind(*value);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .context("count feed posts")?
            .try_get("count")?;

        let page_sql = format!(
            r#"
            SELECT p.id, p.author_id, p.created_at
            FROM posts p
            WHERE {}
            ORDER BY p.created_at DESC, p.id DESC
            LIMIT ? OFFSET ?
            "#,
            filter
        );
        let mut page_query = sqlx::query(&page_sql);
        for value in &binds {
            page_query = page_query.bind(*value);
        }
        let rows = page_query
            .bind(i64::from(request.per_page))
            .bind(i64::try_from(request.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("fetch feed page")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at")?;
            items.push(PostRef {
                id: PostId(row.try_get("id")?),
                author_id: UserId(row.try_get("author_id")?),
                published_at: parse_timestamp(&created_at)?,
            });
        }

        Ok(FeedPage::new(
            items,
            request.page,
            request.per_page,
            u64::try_from(total).unwrap_or(0),
        ))
    }

    async fn hydrate(&self, ids: &[PostId]) -> Result<Vec<Post>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, author_id, body, repost_of, created_at FROM posts WHERE id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at")?;
            let repost_of: Option<i64> = row.try_get("repost_of")?;
            posts.push(Post {
                id: PostId(row.try_get("id")?),
                author_id: UserId(row.try_get("author_id")?),
                body: row.try_get("body")?,
                repost_of: repost_of.map(PostId),
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(posts)
    }
}

#[async_trait]
impl FollowGraph for Database {
    async fn followers_of(&self, user: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT follower_id FROM follows WHERE target_id = ?")
            .bind(user.0)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(UserId(row.try_get("follower_id")?)))
            .collect()
    }
}

// Fixed-width UTC timestamps so ORDER BY on the text column is chronological.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp {:?}", raw))?
        .with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) async fn test_db() -> Result<Database> {
        let db = Database::in_memory().await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Insert `count` posts by `author`, one second apart, oldest first.
    pub(crate) async fn seed_posts(db: &Database, author: UserId, count: usize) -> Result<Vec<PostId>> {
        let start = Utc::now() - Duration::hours(1);
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            ids.push(
                db.insert_post(&NewPost {
                    author_id: author,
                    body: format!("post {} by {}", i, author),
                    repost_of: None,
                    created_at: start + Duration::seconds(i as i64),
                })
                .await?,
            );
        }
        Ok(ids)
    }

    fn request(scope: FeedScope, page: i64) -> PageRequest {
        PageRequest::new(scope, page, 20).unwrap()
    }

    #[tokio::test]
    async fn author_feed_paginates_newest_first() -> Result<()> {
        let db = test_db().await?;
        let author = UserId(1);
        let ids = seed_posts(&db, author, 25).await?;

        let first = db.fetch_page(&request(FeedScope::author(author, None), 1)).await?;
        assert_eq!(first.total, 25);
        assert_eq!(first.last_page, 2);
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.items[0].id, ids[24]);

        let second = db.fetch_page(&request(FeedScope::author(author, None), 2)).await?;
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.items.last().map(|p| p.id), Some(ids[0]));
        Ok(())
    }

    #[tokio::test]
    async fn following_feed_includes_followed_and_own_posts() -> Result<()> {
        let db = test_db().await?;
        let (viewer, followed, stranger) = (UserId(1), UserId(2), UserId(3));
        seed_posts(&db, viewer, 1).await?;
        seed_posts(&db, followed, 2).await?;
        seed_posts(&db, stranger, 3).await?;
        db.insert_follow(viewer, followed).await?;

        let page = db.fetch_page(&request(FeedScope::following(Some(viewer)), 1)).await?;
        assert_eq!(page.total, 3);
        assert!(page.items.iter().all(|p| p.author_id != stranger));
        Ok(())
    }

    #[tokio::test]
    async fn blocks_hide_posts_in_both_directions() -> Result<()> {
        let db = test_db().await?;
        let (viewer, author) = (UserId(1), UserId(2));
        seed_posts(&db, author, 2).await?;
        db.insert_follow(viewer, author).await?;
        db.insert_block(author, viewer).await?;

        let profile = db.fetch_page(&request(FeedScope::author(author, Some(viewer)), 1)).await?;
        assert_eq!(profile.total, 0);
        let home = db.fetch_page(&request(FeedScope::following(Some(viewer)), 1)).await?;
        assert_eq!(home.total, 0);
        assert!(db.followers_of(author).await?.is_empty());

        let anonymous = db.fetch_page(&request(FeedScope::author(author, None), 1)).await?;
        assert_eq!(anonymous.total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn no_reposts_filter_drops_reposts() -> Result<()> {
        let db = test_db().await?;
        let author = UserId(1);
        let original = seed_posts(&db, author, 1).await?[0];
        db.insert_post(&NewPost {
            author_id: author,
            body: String::new(),
            repost_of: Some(original),
            created_at: Utc::now(),
        })
        .await?;

        let all = db.fetch_page(&request(FeedScope::author(author, None), 1)).await?;
        assert_eq!(all.total, 2);
        let filtered = db
            .fetch_page(&request(FeedScope::author(author, None), 1).with_filters([NO_REPOSTS]))
            .await?;
        assert_eq!(filtered.total, 1);
        assert_eq!(filtered.items[0].id, original);
        Ok(())
    }

    #[tokio::test]
    async fn hydrate_skips_missing_posts() -> Result<()> {
        let db = test_db().await?;
        let ids = seed_posts(&db, UserId(1), 2).await?;
        db.delete_post(ids[0]).await?;

        let posts = db.hydrate(&[ids[0], ids[1], PostId(999)]).await?;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, ids[1]);
        assert_eq!(posts[0].body, "post 1 by 1");
        Ok(())
    }
}
