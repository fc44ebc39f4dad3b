//! Read-through cache for feed pages.
//!
//! Each key moves through `Empty -> Computing -> Cached -> (Expired |
//! Invalidated) -> Empty`. Only one computation per key runs at a time;
//! callers arriving while it is in flight wait for its result, success or
//! failure. Failures are never stored.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::{
    backend::{CacheBackend, MokaBackend},
    config::{FeedCacheConfig, InvalidationStrategy},
    error::FeedError,
    keys::{derive_key, generation_of, CacheKey, Generation, GenerationCounters, ScopeIdentity, Unversioned},
    lock::mutex_lock,
    types::{FeedPage, FeedScope, PageRequest},
};

type SharedResult = Result<Arc<FeedPage>, FeedError>;

// Explicit keys do not change on invalidation, so flights are also told
// apart by the generation they started at.
type FlightKey = (CacheKey, Generation);

pub struct FeedCache {
    backend: Arc<dyn CacheBackend>,
    generations: GenerationCounters,
    in_flight: InFlight,
    // Stores hold it shared across the generation check and the put;
    // invalidations hold it exclusively across the bump and the eviction.
    store_gate: RwLock<()>,
    config: FeedCacheConfig,
    counters: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub computes: u64,
    pub coalesced: u64,
    pub bypasses: u64,
    pub entries: u64,
    pub in_flight: usize,
    pub tracked_generations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    computes: AtomicU64,
    coalesced: AtomicU64,
    bypasses: AtomicU64,
}

impl FeedCache {
    pub fn new(config: FeedCacheConfig) -> Self {
        let backend = Arc::new(MokaBackend::new(&config));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: FeedCacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            generations: GenerationCounters::new(),
            in_flight: InFlight::default(),
            store_gate: RwLock::new(()),
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &FeedCacheConfig {
        &self.config
    }

    pub fn key_for(&self, request: &PageRequest) -> CacheKey {
        match self.config.invalidation_strategy {
            InvalidationStrategy::Generation => derive_key(request, &self.generations),
            InvalidationStrategy::Explicit => derive_key(request, &Unversioned),
        }
    }

    /// Return the cached page for `request`, running `compute` on a miss.
    pub async fn get_or_compute<F, Fut>(
        &self,
        request: &PageRequest,
        compute: F,
    ) -> Result<Arc<FeedPage>, FeedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<FeedPage>>,
    {
        if request.scope.is_anonymous_timeline() {
            return Ok(Arc::new(FeedPage::empty(request)));
        }

        let key = self.key_for(request);
        match self.backend.get(&key).await {
            Ok(Some(page)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, "Feed cache hit");
                return Ok(page);
            }
            Ok(None) => {}
            Err(e) => {
                self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
                warn!(cache_key = %key, error = %e, "Feed cache unavailable, computing page directly");
                return self.run(compute).await;
            }
        }

        let generation = self.generation_for(&request.scope);
        match self.in_flight.join(&key, generation) {
            Flight::Follow(mut receiver) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, "Waiting for in-flight feed computation");
                match receiver.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(FeedError::compute(anyhow!(
                        "in-flight computation for {} was abandoned",
                        key
                    ))),
                }
            }
            Flight::Lead(lease) => {
                // A previous leader may have stored the page between our miss and join.
                if let Ok(Some(page)) = self.backend.get(&key).await {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    let result = Ok(page);
                    lease.complete(&result);
                    return result;
                }

                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, "Feed cache miss, computing page");
                let result = self.run(compute).await;
                if let Ok(page) = &result {
                    self.store(&key, &request.scope, generation, page).await;
                }
                lease.complete(&result);
                result
            }
        }
    }

    /// Compute the page for `request` without consulting the cache, then
    /// store it. Used when a caller must observe its own write.
    pub async fn get_fresh<F, Fut>(
        &self,
        request: &PageRequest,
        compute: F,
    ) -> Result<Arc<FeedPage>, FeedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<FeedPage>>,
    {
        if request.scope.is_anonymous_timeline() {
            return Ok(Arc::new(FeedPage::empty(request)));
        }

        let key = self.key_for(request);
        let before = self.generation_for(&request.scope);
        let result = self.run(compute).await;
        if let Ok(page) = &result {
            self.store(&key, &request.scope, before, page).await;
        }
        result
    }

    /// Make every cached page that depends on `identity` unreachable.
    pub async fn invalidate(&self, identity: &ScopeIdentity) -> Result<(), FeedError> {
        let _gate = self.store_gate.write().await;
        let generation = self.generations.bump(identity);
        debug!(identity = %identity, generation, "Invalidating feed pages");

        match self.config.invalidation_strategy {
            InvalidationStrategy::Generation => Ok(()),
            InvalidationStrategy::Explicit => self.backend.evict(identity).await.map_err(|e| {
                warn!(identity = %identity, error = %e, "Failed to evict feed pages");
                FeedError::from(e)
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            computes: self.counters.computes.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            entries: self.backend.entry_count(),
            in_flight: self.in_flight.len(),
            tracked_generations: self.generations.len(),
        }
    }

    pub async fn run_maintenance(&self) {
        self.backend.run_maintenance().await;

        // Once an identity has been quiet for longer than any page or
        // computation can live, no key or flight still refers to its counter.
        let idle = self.config.ttl().max(self.config.compute_timeout());
        let pruned = self.generations.prune(idle);
        if pruned > 0 {
            debug!(pruned, "Pruned idle generation counters");
        }
    }

    fn generation_for(&self, scope: &FeedScope) -> Generation {
        generation_of(scope, &self.generations)
    }

    async fn run<F, Fut>(&self, compute: F) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<FeedPage>>,
    {
        self.counters.computes.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.config.compute_timeout(), compute()).await {
            Ok(Ok(page)) => Ok(Arc::new(page)),
            Ok(Err(e)) => Err(FeedError::compute(e)),
            Err(_) => Err(FeedError::compute(anyhow!(
                "feed computation timed out after {}ms",
                self.config.compute_timeout_ms
            ))),
        }
    }

    async fn store(&self, key: &CacheKey, scope: &FeedScope, before: Generation, page: &Arc<FeedPage>) {
        let _gate = self.store_gate.read().await;
        if self.generation_for(scope) != before {
            debug!(cache_key = %key, "Scope invalidated during computation, not caching page");
            return;
        }
        if let Err(e) = self.backend.put(key.clone(), Arc::clone(page)).await {
            warn!(cache_key = %key, error = %e, "Failed to store feed page");
        }
    }
}

/// Computations currently running, keyed by cache key and starting generation.
#[derive(Default)]
struct InFlight {
    flights: Mutex<HashMap<FlightKey, broadcast::Sender<SharedResult>>>,
}

enum Flight<'a> {
    Lead(FlightLease<'a>),
    Follow(broadcast::Receiver<SharedResult>),
}

impl InFlight {
    fn join(&self, key: &CacheKey, generation: Generation) -> Flight<'_> {
        let key = (key.clone(), generation);
        let mut flights = mutex_lock(&self.flights, "in_flight.join");
        if let Some(sender) = flights.get(&key) {
            return Flight::Follow(sender.subscribe());
        }

        let (sender, _) = broadcast::channel(1);
        flights.insert(key.clone(), sender.clone());
        Flight::Lead(FlightLease {
            in_flight: self,
            key,
            sender: Some(sender),
        })
    }

    fn len(&self) -> usize {
        mutex_lock(&self.flights, "in_flight.len").len()
    }

    fn release(&self, key: &FlightKey) {
        mutex_lock(&self.flights, "in_flight.release").remove(key);
    }
}

/// Held by the caller computing a key. Dropping it without completing
/// (e.g. the request was cancelled) closes the channel and fails the waiters.
struct FlightLease<'a> {
    in_flight: &'a InFlight,
    key: FlightKey,
    sender: Option<broadcast::Sender<SharedResult>>,
}

impl FlightLease<'_> {
    fn complete(mut self, result: &SharedResult) {
        // Unregister before sending: every subscriber joined under the map
        // lock, so all of them are attached to this sender already.
        self.in_flight.release(&self.key);
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result.clone());
        }
    }
}

impl Drop for FlightLease<'_> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.in_flight.release(&self.key);
        }
    }
}
