//! Read-through cache with stampede protection.
//!
//! [`CacheManager`] serves read operations from a local store when a live
//! entry exists, and otherwise fetches once and populates. Concurrent
//! callers missing on the same key collapse into exactly one fetch: a single
//! leader runs the fetch while followers wait on its in-flight marker, then
//! re-read the store.
//!
//! Writes never update the cache here; the batch executor and transaction
//! manager invalidate affected entities after successful writes.
//!
//! # Example
//!
//! ```ignore
//! use ballast_cache::{CacheManager, CacheConfig, CachedValue};
//!
//! let cache = CacheManager::new(CacheConfig::default());
//! let value = cache
//!     .get_or_fetch(&operation, || async { fetch_remote().await })
//!     .await?;
//! ```

pub mod metrics;
pub mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use ballast_types::{CacheKey, Error, KeyPattern, Operation};

pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use store::{CacheStore, CachedValue, MemoryStore, StoreLookup};

/// Which storage backend the manager uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    #[default]
    Memory,
}

/// Cache manager configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    /// LRU capacity bound.
    pub max_entries: usize,
    /// TTL applied to entries unless overridden per call. `None` caches
    /// without expiry.
    pub default_ttl: Option<Duration>,
    /// When set, fetch failures are cached for this long (negative
    /// caching). Off by default: a failure must not poison the cache.
    pub negative_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            backend: CacheBackendKind::Memory,
            max_entries: 1024,
            default_ttl: Some(Duration::from_secs(60)),
            negative_ttl: None,
        }
    }
}

/// Leader/follower coordination for in-flight fetches, one marker per key.
///
/// The leader holds a `watch::Sender`; followers clone the receiver and wait
/// for the completion signal, then re-read the store. If a leader is
/// cancelled its sender drops, the wait resolves with an error, and the next
/// caller through finds the dead marker and replaces it. The marker is
/// cleared on success, failure, and cancellation alike.
#[derive(Default)]
struct FetchPool {
    inflight: Mutex<HashMap<CacheKey, watch::Receiver<()>>>,
}

enum Role {
    Leader(watch::Sender<()>),
    Follower(watch::Receiver<()>),
}

impl FetchPool {
    fn join(&self, key: &CacheKey) -> Role {
        let mut inflight = self.inflight.lock();
        if let Some(rx) = inflight.get(key) {
            // A marker whose sender is gone belongs to a cancelled leader.
            if rx.has_changed().is_ok() {
                return Role::Follower(rx.clone());
            }
            inflight.remove(key);
        }
        let (tx, rx) = watch::channel(());
        inflight.insert(key.clone(), rx);
        Role::Leader(tx)
    }

    fn complete(&self, key: &CacheKey, tx: watch::Sender<()>) {
        self.inflight.lock().remove(key);
        let _ = tx.send(());
    }
}

/// Read-through cache sitting in front of the retry layer.
pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    pool: FetchPool,
    metrics: CacheMetrics,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        let store: Arc<dyn CacheStore> = match config.backend {
            CacheBackendKind::Memory => Arc::new(MemoryStore::new(config.max_entries)),
        };
        CacheManager {
            config,
            store,
            pool: FetchPool::default(),
            metrics: CacheMetrics::default(),
        }
    }

    /// Serve `operation` from cache, or fetch once and populate.
    ///
    /// Uses the configured default TTL.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        operation: &Operation,
        fetch: F,
    ) -> Result<CachedValue, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CachedValue, Error>>,
    {
        self.get_or_fetch_with_ttl(operation, self.config.default_ttl, fetch)
            .await
    }

    /// Serve `operation` from cache with an explicit entry TTL.
    pub async fn get_or_fetch_with_ttl<F, Fut>(
        &self,
        operation: &Operation,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<CachedValue, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CachedValue, Error>>,
    {
        let key = operation.cache_key();

        loop {
            match self.store.get(&key) {
                StoreLookup::Hit(value) => return self.hit(&key, value),
                StoreLookup::Expired => {
                    self.metrics.record_expired();
                    self.metrics.record_miss();
                }
                StoreLookup::Miss => self.metrics.record_miss(),
            }

            match self.pool.join(&key) {
                Role::Leader(tx) => {
                    // The previous leader may have populated the store
                    // between our lookup and taking the marker.
                    if let StoreLookup::Hit(value) = self.store.get(&key) {
                        self.pool.complete(&key, tx);
                        return self.hit(&key, value);
                    }

                    debug!(key = %key, "cache miss, fetching");
                    let result = fetch().await;
                    match &result {
                        Ok(value) => {
                            let evicted = self.store.put(key.clone(), value.clone(), ttl);
                            self.metrics.record_store();
                            self.metrics.record_evictions(evicted as u64);
                        }
                        Err(err) => {
                            if let Some(negative_ttl) = self.config.negative_ttl {
                                let evicted = self.store.put(
                                    key.clone(),
                                    CachedValue::Negative(err.clone()),
                                    Some(negative_ttl),
                                );
                                self.metrics.record_store();
                                self.metrics.record_evictions(evicted as u64);
                            }
                        }
                    }
                    self.pool.complete(&key, tx);
                    return result;
                }
                Role::Follower(mut rx) => {
                    self.metrics.record_stampede_wait();
                    // Either outcome sends us back around the loop: a
                    // completion signal, or a dropped sender from a
                    // cancelled leader.
                    let _ = rx.changed().await;
                }
            }
        }
    }

    fn hit(&self, key: &CacheKey, value: CachedValue) -> Result<CachedValue, Error> {
        match value {
            CachedValue::Negative(err) => {
                self.metrics.record_negative_hit();
                debug!(key = %key, error = %err, "serving cached failure");
                Err(err)
            }
            value => {
                self.metrics.record_hit();
                Ok(value)
            }
        }
    }

    /// Remove entries matching `pattern`. Best-effort; unrelated in-flight
    /// fetches are not blocked.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let removed = self.store.remove_matching(pattern);
        self.metrics.record_invalidated(removed as u64);
        if removed > 0 {
            debug!(?pattern, removed, "invalidated cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn read_op(entity: &str) -> Operation {
        Operation::read(entity)
    }

    fn config(ttl_ms: Option<u64>) -> CacheConfig {
        CacheConfig {
            default_ttl: ttl_ms.map(Duration::from_millis),
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_second_lookup_served_from_cache() {
        let cache = CacheManager::new(config(None));
        let fetches = AtomicU64::new(0);
        let op = read_op("invoice");

        for _ in 0..3 {
            let value = cache
                .get_or_fetch(&op, || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Ok(CachedValue::Count(5)) }
                })
                .await
                .unwrap();
            assert_eq!(value.count(), Some(5));
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        let m = cache.metrics();
        assert_eq!(m.hits, 2);
        assert_eq!(m.misses, 1);
    }

    #[tokio::test]
    async fn test_stampede_collapses_to_one_fetch() {
        let cache = Arc::new(CacheManager::new(config(None)));
        let fetches = Arc::new(AtomicU64::new(0));
        let op = read_op("invoice");

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            let op = op.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&op, || {
                        let fetches = fetches.clone();
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            // Hold the fetch open so every task piles up.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(CachedValue::Count(1))
                        }
                    })
                    .await
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_poison() {
        let cache = CacheManager::new(config(None));
        let fetches = AtomicU64::new(0);
        let op = read_op("invoice");

        let first = cache
            .get_or_fetch(&op, || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Err::<CachedValue, _>(Error::Network("down".into())) }
            })
            .await;
        assert!(first.is_err());

        // The failure was not cached; the next caller fetches again.
        let second = cache
            .get_or_fetch(&op, || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(CachedValue::Count(9)) }
            })
            .await;
        assert_eq!(second.unwrap().count(), Some(9));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_caching_when_configured() {
        let cache = CacheManager::new(CacheConfig {
            negative_ttl: Some(Duration::from_secs(60)),
            ..CacheConfig::default()
        });
        let fetches = AtomicU64::new(0);
        let op = read_op("invoice");

        for _ in 0..2 {
            let result = cache
                .get_or_fetch(&op, || {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    async { Err::<CachedValue, _>(Error::server("boom", None)) }
                })
                .await;
            assert!(matches!(result, Err(Error::Server { .. })));
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().negative_hits, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_triggers_one_refetch() {
        let cache = CacheManager::new(config(Some(100)));
        let fetches = AtomicU64::new(0);
        let op = read_op("invoice");

        let fetch = || {
            fetches.fetch_add(1, Ordering::SeqCst);
            async { Ok(CachedValue::Count(1)) }
        };

        cache.get_or_fetch(&op, fetch).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.get_or_fetch(&op, fetch).await.unwrap();
        cache.get_or_fetch(&op, fetch).await.unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.metrics().expired, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_entity() {
        let cache = CacheManager::new(config(None));
        let invoice = read_op("invoice");
        let partner = read_op("partner");

        cache
            .get_or_fetch(&invoice, || async { Ok(CachedValue::Count(1)) })
            .await
            .unwrap();
        cache
            .get_or_fetch(&partner, || async { Ok(CachedValue::Count(2)) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        let removed = cache.invalidate(&KeyPattern::Entity("invoice".into()));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);

        // Partner entry survived.
        let fetches = AtomicU64::new(0);
        cache
            .get_or_fetch(&partner, || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(CachedValue::Count(2)) }
            })
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }
}
