use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The audience a feed page is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedScope {
    /// Home timeline: the viewer's own posts and posts from accounts they follow.
    Following { viewer: Option<UserId> },
    /// A single profile; the viewer only matters for block visibility.
    Author {
        author: UserId,
        viewer: Option<UserId>,
    },
}

impl FeedScope {
    pub fn following(viewer: Option<UserId>) -> Self {
        Self::Following { viewer }
    }

    pub fn author(author: UserId, viewer: Option<UserId>) -> Self {
        Self::Author { author, viewer }
    }

    pub fn viewer(&self) -> Option<UserId> {
        match self {
            Self::Following { viewer } | Self::Author { viewer, .. } => *viewer,
        }
    }

    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::Following { .. } => "following",
            Self::Author { .. } => "author",
        }
    }

    /// A signed-in viewer looking at their own timeline or profile.
    pub fn is_own(&self) -> bool {
        match self {
            Self::Following { viewer } => viewer.is_some(),
            Self::Author { author, viewer } => *viewer == Some(*author),
        }
    }

    /// Anonymous home timelines are always empty and never cached.
    pub fn is_anonymous_timeline(&self) -> bool {
        matches!(self, Self::Following { viewer: None })
    }
}

impl fmt::Display for FeedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let viewer = match self.viewer() {
            Some(id) => id.to_string(),
            None => "anon".to_string(),
        };
        match self {
            Self::Following { .. } => write!(f, "{}:{}", self.discriminator(), viewer),
            Self::Author { author, .. } => {
                write!(f, "{}:{}:{}", self.discriminator(), author, viewer)
            }
        }
    }
}

/// A validated request for one page of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub scope: FeedScope,
    pub page: u32,
    pub per_page: u32,
    pub filters: BTreeSet<String>,
}

impl PageRequest {
    /// Pages below 1 are clamped to 1; a non-positive page size is rejected.
    pub fn new(scope: FeedScope, page: i64, per_page: i64) -> Result<Self, FeedError> {
        if per_page <= 0 {
            return Err(FeedError::InvalidPageRequest { per_page });
        }

        Ok(Self {
            scope,
            page: u32::try_from(page.max(1)).unwrap_or(u32::MAX),
            per_page: u32::try_from(per_page).unwrap_or(u32::MAX),
            filters: BTreeSet::new(),
        })
    }

    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.filters.extend(
            filters
                .into_iter()
                .map(|token| token.as_ref().trim().to_ascii_lowercase())
                .filter(|token| !token.is_empty()),
        );
        self
    }

    pub fn has_filter(&self, token: &str) -> bool {
        self.filters.contains(token)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

/// Just enough of a post to order it and load it again from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRef {
    pub id: PostId,
    pub author_id: UserId,
    pub published_at: DateTime<Utc>,
}

/// One computed page of a feed, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub items: Vec<PostRef>,
    pub current_page: u32,
    pub last_page: u32,
    pub per_page: u32,
    pub total: u64,
    pub generated_at: DateTime<Utc>,
}

impl FeedPage {
    pub fn new(items: Vec<PostRef>, current_page: u32, per_page: u32, total: u64) -> Self {
        let per_page = per_page.max(1);
        let last_page = total.div_ceil(u64::from(per_page)).max(1);

        Self {
            items,
            current_page: current_page.max(1),
            last_page: u32::try_from(last_page).unwrap_or(u32::MAX),
            per_page,
            total,
            generated_at: Utc::now(),
        }
    }

    pub fn empty(request: &PageRequest) -> Self {
        Self::new(Vec::new(), request.page, request.per_page, 0)
    }
}

/// A fully loaded post, as rendered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub body: String,
    pub repost_of: Option<PostId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub author_id: UserId,
    pub body: String,
    pub repost_of: Option<PostId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    pub page: Option<i64>,
    /// Comma separated filter tokens, e.g. `no_reposts`
    pub filters: Option<String>,
    /// Skip the cached copy; only honored on the viewer's own feeds.
    #[serde(default)]
    pub fresh: bool,
}

impl FeedParams {
    pub fn filter_tokens(&self) -> Vec<&str> {
        self.filters
            .as_deref()
            .map(|raw| raw.split(',').collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_below_one_is_clamped() {
        for page in [0, -1, i64::MIN] {
            let request = PageRequest::new(FeedScope::following(Some(UserId(1))), page, 20)
                .expect("valid request");
            assert_eq!(request.page, 1);
            assert_eq!(request.offset(), 0);
        }
    }

    #[test]
    fn non_positive_per_page_is_rejected() {
        let err = PageRequest::new(FeedScope::following(Some(UserId(1))), 1, 0).unwrap_err();
        assert!(matches!(err, FeedError::InvalidPageRequest { per_page: 0 }));
        assert!(PageRequest::new(FeedScope::following(None), 1, -5).is_err());
    }

    #[test]
    fn filters_are_normalized_sorted_and_deduplicated() {
        let request = PageRequest::new(FeedScope::author(UserId(2), None), 1, 20)
            .unwrap()
            .with_filters(["No_Reposts", "media", " ", "no_reposts"]);
        let tokens: Vec<_> = request.filters.iter().cloned().collect();
        assert_eq!(tokens, vec!["media".to_string(), "no_reposts".to_string()]);
    }

    #[test]
    fn last_page_follows_total() {
        assert_eq!(FeedPage::new(Vec::new(), 1, 20, 25).last_page, 2);
        assert_eq!(FeedPage::new(Vec::new(), 1, 20, 40).last_page, 2);
        assert_eq!(FeedPage::new(Vec::new(), 1, 20, 0).last_page, 1);
    }

    #[test]
    fn own_scopes() {
        assert!(FeedScope::following(Some(UserId(1))).is_own());
        assert!(FeedScope::author(UserId(1), Some(UserId(1))).is_own());
        assert!(!FeedScope::author(UserId(1), Some(UserId(2))).is_own());
        assert!(!FeedScope::author(UserId(1), None).is_own());
    }

    #[test]
    fn scope_display() {
        assert_eq!(FeedScope::following(Some(UserId(7))).to_string(), "following:7");
        assert_eq!(FeedScope::author(UserId(3), None).to_string(), "author:3:anon");
    }
}
