//! Caching primitives for the data-access layer: a TTL cache with
//! per-entry lifetimes and a per-key singleflight that collapses
//! concurrent misses into one upstream fetch.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// A thread-safe TTL cache backed by `DashMap`.
///
/// Each entry carries its own time-to-live so short-lived negative
/// entries can coexist with regular ones. Expired entries are lazily
/// evicted on access.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    inner: Arc<DashMap<K, (V, Instant, Duration)>>,
    default_ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Create a new cache with the given default time-to-live.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            default_ttl,
        }
    }

    /// Get a cached value if it exists and hasn't expired.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.inner.get(key) {
            let (val, inserted, ttl) = entry.value();
            if inserted.elapsed() < *ttl {
                return Some(val.clone());
            }
            // Expired — drop the read guard before removing
            drop(entry);
            self.inner.remove(key);
        }
        None
    }

    /// Insert or update a value with the default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or update a value with an explicit TTL.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.inner.insert(key, (value, Instant::now(), ttl));
    }

    /// Remove a specific entry from the cache.
    pub fn remove(&self, key: &K) {
        self.inner.remove(key);
    }

    /// Remove all entries from the cache.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Remove all expired entries.
    pub fn evict_expired(&self) {
        self.inner
            .retain(|_, (_, inserted, ttl)| inserted.elapsed() < *ttl);
    }

    /// Keep only entries for which the predicate holds. Used for
    /// targeted invalidation of dependent keys.
    pub fn retain(&self, mut f: impl FnMut(&K, &V) -> bool) {
        self.inner.retain(|k, (v, _, _)| f(k, v));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Per-key collapse of concurrent fetches.
///
/// While a fetch for key `K` is in flight, further callers for the same
/// key await its result instead of issuing their own. When the leading
/// fetch fails, the next waiter retries upstream; a success is handed to
/// every waiter and the key is cleared so later misses fetch fresh.
pub struct Singleflight<K, V> {
    inflight: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Singleflight<K, V> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `fetch` for `key`, sharing the result with concurrent callers.
    pub async fn run<E, F, Fut>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell.get_or_try_init(fetch).await.cloned();

        // First finisher clears the slot; a stale Arc left by a racing
        // insert must not be removed.
        self.inflight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        result
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Singleflight<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ttl_cache_expires_entries() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn per_entry_ttl_overrides_default() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert_with_ttl("neg", 0, Duration::from_millis(10));
        cache.insert("pos", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"neg"), None);
        assert_eq!(cache.get(&"pos"), Some(1));
    }

    #[test]
    fn evict_expired_sweeps() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_millis(5));
        for i in 0..10 {
            cache.insert(i, i);
        }
        std::thread::sleep(Duration::from_millis(10));
        cache.evict_expired();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_issue_one_fetch() {
        let sf: Arc<Singleflight<String, u32>> = Arc::new(Singleflight::new());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let sf = sf.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                sf.run("k".to_string(), || {
                    let fetches = fetches.clone();
                    async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ()>(42)
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(42));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_lets_next_caller_retry() {
        let sf: Singleflight<&str, u32> = Singleflight::new();
        let r1: Result<u32, &str> = sf.run("k", || async { Err("down") }).await;
        assert_eq!(r1, Err("down"));
        let r2: Result<u32, &str> = sf.run("k", || async { Ok(7) }).await;
        assert_eq!(r2, Ok(7));
    }

    #[tokio::test]
    async fn sequential_runs_fetch_independently() {
        let sf: Singleflight<&str, u32> = Singleflight::new();
        let count = AtomicUsize::new(0);
        for _ in 0..3 {
            let r: Result<u32, ()> = sf
                .run("k", || {
                    count.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                })
                .await;
            assert_eq!(r, Ok(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
