//! Cache key derivation.
//!
//! A key is the page request plus the generation of every entity the scope
//! depends on. Bumping a generation makes later lookups derive a new key, so
//! pages computed before the change are never read again.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::lock::{rw_read, rw_write};
use crate::types::{FeedScope, PageRequest, UserId};

/// Bump when the key layout changes.
pub const KEY_VERSION: u32 = 1;

/// The unit of invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeIdentity {
    /// Anything that depends on who the viewer follows or blocks.
    Viewer(UserId),
    /// Anything that depends on what the author has published.
    Author(UserId),
}

impl fmt::Display for ScopeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Viewer(id) => write!(f, "viewer:{}", id),
            Self::Author(id) => write!(f, "author:{}", id),
        }
    }
}

/// Identities whose changes can alter the pages of `scope`.
pub fn scope_identities(scope: &FeedScope) -> Vec<ScopeIdentity> {
    let mut identities = Vec::with_capacity(2);
    if let FeedScope::Author { author, .. } = scope {
        identities.push(ScopeIdentity::Author(*author));
    }
    if let Some(viewer) = scope.viewer() {
        identities.push(ScopeIdentity::Viewer(viewer));
    }
    identities
}

pub trait GenerationLookup: Send + Sync {
    fn generation(&self, identity: &ScopeIdentity) -> u64;
}

/// In-process generation counters.
///
/// Holds one entry per identity invalidated recently, so memory is bounded by
/// the number of users written to within the idle window passed to `prune`.
#[derive(Debug, Default)]
pub struct GenerationCounters {
    counters: RwLock<HashMap<ScopeIdentity, Counter>>,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    generation: u64,
    bumped_at: Instant,
}

impl GenerationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the identity's generation and return the new value.
    pub fn bump(&self, identity: &ScopeIdentity) -> u64 {
        let mut counters = rw_write(&self.counters, "generation.bump");
        let counter = counters.entry(*identity).or_insert(Counter {
            generation: 0,
            bumped_at: Instant::now(),
        });
        counter.generation += 1;
        counter.bumped_at = Instant::now();
        counter.generation
    }

    /// Forget identities not bumped within `idle`, returning how many were dropped.
    ///
    /// A forgotten identity reads as generation 0 again. That is only sound
    /// when `idle` outlives every cached page and running computation, since
    /// those all started after the last bump and carry its generation.
    pub fn prune(&self, idle: Duration) -> usize {
        let mut counters = rw_write(&self.counters, "generation.prune");
        let before = counters.len();
        counters.retain(|_, counter| counter.bumped_at.elapsed() < idle);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.counters, "generation.len").len()
    }
}

impl GenerationLookup for GenerationCounters {
    fn generation(&self, identity: &ScopeIdentity) -> u64 {
        rw_read(&self.counters, "generation.read")
            .get(identity)
            .map(|counter| counter.generation)
            .unwrap_or(0)
    }
}

/// Lookup used when invalidation evicts entries instead of versioning keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unversioned;

impl GenerationLookup for Unversioned {
    fn generation(&self, _identity: &ScopeIdentity) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Generation {
    pub viewer: u64,
    pub author: u64,
}

pub fn generation_of(scope: &FeedScope, lookup: &dyn GenerationLookup) -> Generation {
    let viewer = scope
        .viewer()
        .map(|id| lookup.generation(&ScopeIdentity::Viewer(id)))
        .unwrap_or(0);
    let author = match scope {
        FeedScope::Author { author, .. } => lookup.generation(&ScopeIdentity::Author(*author)),
        FeedScope::Following { .. } => 0,
    };
    Generation { viewer, author }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: FeedScope,
    page: u32,
    per_page: u32,
    filters: Vec<String>,
    generation: Generation,
}

impl CacheKey {
    pub fn depends_on(&self, identity: &ScopeIdentity) -> bool {
        scope_identities(&self.scope).contains(identity)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "feed:v{}:{}:p{}:n{}:f[{}]:g{}.{}",
            KEY_VERSION,
            self.scope,
            self.page,
            self.per_page,
            self.filters.join(","),
            self.generation.viewer,
            self.generation.author
        )
    }
}

/// Derive the key for `request` at the generations currently visible in `lookup`.
pub fn derive_key(request: &PageRequest, lookup: &dyn GenerationLookup) -> CacheKey {
    CacheKey {
        scope: request.scope,
        page: request.page.max(1),
        per_page: request.per_page,
        // BTreeSet iteration is already sorted and deduplicated
        filters: request.filters.iter().cloned().collect(),
        generation: generation_of(&request.scope, lookup),
    }
}
