use std::sync::Arc;

use thiserror::Error;

/// Failure of the storage that backs the feed cache.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Errors surfaced by the feed cache and the feed service.
///
/// Cloneable so a single failed computation can be handed to every caller
/// waiting on the same key.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("invalid page request: per_page must be positive, got {per_page}")]
    InvalidPageRequest { per_page: i64 },

    #[error("feed computation failed: {0:#}")]
    ComputeFailure(Arc<anyhow::Error>),

    #[error("feed cache backend unavailable: {0}")]
    CacheBackendUnavailable(#[from] BackendError),

    #[error("failed to hydrate feed posts: {0:#}")]
    HydrationFailure(Arc<anyhow::Error>),
}

impl FeedError {
    pub fn compute(err: anyhow::Error) -> Self {
        Self::ComputeFailure(Arc::new(err))
    }

    pub fn hydration(err: anyhow::Error) -> Self {
        Self::HydrationFailure(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn compute_failure_keeps_context_chain() {
        let err = FeedError::compute(anyhow!("connection reset").context("fetch page"));
        assert_eq!(
            err.to_string(),
            "feed computation failed: fetch page: connection reset"
        );
    }

    #[test]
    fn backend_error_converts() {
        let err: FeedError = BackendError("redis down".to_string()).into();
        assert!(matches!(err, FeedError::CacheBackendUnavailable(_)));
        assert_eq!(err.to_string(), "feed cache backend unavailable: redis down");
    }
}
