//! Bounded LRU cache with time-to-idle expiry
//!
//! Entries are evicted in least-recently-used order once the cache is full,
//! and dropped lazily on lookup once they have not been touched for the
//! configured idle time.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
    }
}

struct CacheEntry<V> {
    value: V,
    last_access: Instant,
    /// Position in the recency order
    tick: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Hash + Eq + Clone, V> CacheState<K, V> {
    fn touch(&mut self, key: &K) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.insert(tick, key.clone());
        tick
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

/// Thread-safe bounded cache
pub struct IdleCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    capacity: usize,
    idle: Duration,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V: Clone> IdleCache<K, V> {
    /// Create a cache holding at most `capacity` entries, each expiring after
    /// `idle` without access
    pub fn new(capacity: usize, idle: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::with_capacity(capacity.min(1024)),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
            capacity: capacity.max(1),
            idle,
            stats: CacheStats::default(),
        }
    }

    /// Get a value, refreshing its recency and idle timer
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.state.lock();
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => now.duration_since(entry.last_access) >= self.idle,
        };
        if expired {
            state.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let (owned_key, old_tick) = {
            let (k, entry) = state.entries.get_key_value(key)?;
            (k.clone(), entry.tick)
        };
        state.recency.remove(&old_tick);
        let tick = state.touch(&owned_key);
        let entry = state.entries.get_mut(key)?;
        entry.tick = tick;
        entry.last_access = now;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert or replace a value, evicting the least recently used entry
    /// when full
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.remove(&key);

        while state.entries.len() >= self.capacity {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = state.touch(&key);
        state.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: Instant::now(),
                tick,
            },
        );
    }

    /// Drop a key. Returns whether it was cached.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().remove(key).is_some()
    }

    /// Number of cached entries, including ones that expired but were not
    /// looked up since
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
