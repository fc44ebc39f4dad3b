use std::time::Duration;

use clap::{Args, ValueEnum};

const DEFAULT_TTL_SECONDS: u64 = 60;
const DEFAULT_PER_PAGE: u32 = 20;
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;
const DEFAULT_COMPUTE_TIMEOUT_MS: u64 = 5_000;

/// How write events make cached pages unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum InvalidationStrategy {
    /// Evict every stored page that depends on the changed identity.
    Explicit,
    /// Bump the identity's generation so new lookups derive a different key.
    #[default]
    Generation,
}

/// Feed cache settings, read from flags or the environment.
#[derive(Debug, Clone, Args)]
pub struct FeedCacheConfig {
    /// Lifetime of a cached feed page
    #[arg(long, env = "FEED_CACHE_TTL_SECONDS", default_value_t = DEFAULT_TTL_SECONDS)]
    pub ttl_seconds: u64,

    /// Page size used by the timeline endpoints
    #[arg(long, env = "FEED_DEFAULT_PER_PAGE", default_value_t = DEFAULT_PER_PAGE)]
    pub default_per_page: u32,

    #[arg(
        long,
        env = "FEED_INVALIDATION_STRATEGY",
        value_enum,
        default_value_t = InvalidationStrategy::Generation
    )]
    pub invalidation_strategy: InvalidationStrategy,

    /// Maximum number of cached pages
    #[arg(long, env = "FEED_CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: u64,

    /// Upper bound on a single post store query
    #[arg(long, env = "FEED_COMPUTE_TIMEOUT_MS", default_value_t = DEFAULT_COMPUTE_TIMEOUT_MS)]
    pub compute_timeout_ms: u64,
}

impl Default for FeedCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            default_per_page: DEFAULT_PER_PAGE,
            invalidation_strategy: InvalidationStrategy::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            compute_timeout_ms: DEFAULT_COMPUTE_TIMEOUT_MS,
        }
    }
}

impl FeedCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }
}
