//! Cache stores: pluggable storage with TTL and LRU eviction.
//!
//! An entry is evicted when either condition triggers: its TTL has expired
//! (checked lazily on lookup) or the store is at capacity and the entry is
//! the least recently used.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use ballast_types::{CacheKey, Error, KeyPattern, Record};

/// A cached read result.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Records(Vec<Record>),
    Count(u64),
    /// A cached failure (negative caching); only stored when explicitly
    /// configured.
    Negative(Error),
}

impl CachedValue {
    /// The record list, for `Records` values.
    pub fn records(&self) -> Option<&[Record]> {
        match self {
            CachedValue::Records(r) => Some(r),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            CachedValue::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Result of a store lookup. `Expired` is distinguished from `Miss` so the
/// manager can count stale evictions separately.
#[derive(Debug)]
pub enum StoreLookup {
    Hit(CachedValue),
    Expired,
    Miss,
}

/// Storage backend for the cache manager.
///
/// Implementations are synchronous and internally locked; the manager holds
/// no lock across awaits.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> StoreLookup;

    /// Insert an entry. Returns the number of entries evicted to make room.
    fn put(&self, key: CacheKey, value: CachedValue, ttl: Option<Duration>) -> usize;

    /// Remove entries matching the pattern, returning how many were removed.
    fn remove_matching(&self, pattern: &KeyPattern) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

struct Entry {
    value: CachedValue,
    created: Instant,
    ttl: Option<Duration>,
    /// Monotonic access counter for LRU ordering.
    tick: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.created.elapsed() >= ttl)
    }
}

struct StoreInner {
    map: HashMap<CacheKey, Entry>,
    tick: u64,
}

/// In-memory store: a key map behind one `RwLock`, TTL checked on lookup,
/// LRU eviction on insert.
pub struct MemoryStore {
    max_entries: usize,
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        assert!(max_entries > 0, "cache max_entries must be at least 1");
        MemoryStore {
            max_entries,
            inner: RwLock::new(StoreInner {
                map: HashMap::new(),
                tick: 0,
            }),
        }
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> StoreLookup {
        let mut inner = self.inner.write();
        let expired = match inner.map.get(key) {
            None => return StoreLookup::Miss,
            Some(entry) => entry.is_expired(),
        };
        if expired {
            inner.map.remove(key);
            return StoreLookup::Expired;
        }
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.map.get_mut(key).expect("present unless expired");
        entry.tick = tick;
        StoreLookup::Hit(entry.value.clone())
    }

    fn put(&self, key: CacheKey, value: CachedValue, ttl: Option<Duration>) -> usize {
        let mut inner = self.inner.write();
        let mut evicted = 0;

        if !inner.map.contains_key(&key) && inner.map.len() >= self.max_entries {
            // Least-recently-used entry goes first. Linear scan: the map is
            // capacity-bounded and small.
            let lru_key = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.tick)
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru_key {
                inner.map.remove(&lru_key);
                evicted += 1;
            }
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            key,
            Entry {
                value,
                created: Instant::now(),
                ttl,
                tick,
            },
        );
        evicted
    }

    fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        let mut inner = self.inner.write();
        let before = inner.map.len();
        inner.map.retain(|key, _| !pattern.matches(key));
        before - inner.map.len()
    }

    fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    fn clear(&self) {
        self.inner.write().map.clear();
    }
}
