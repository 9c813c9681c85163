//! Short-TTL read cache over any [`DataAccess`].
//!
//! Misses fetch through with per-key singleflight so only one upstream
//! request is issued per key per in-flight miss. Not-found results are
//! cached negatively for a shorter interval; upstream failures and
//! transport errors are never cached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use funcd_cache::{Singleflight, TtlCache};
use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::{Error, Result};

use crate::DataAccess;

/// Cache tuning. TTLs are on the order of seconds; readers may observe a
/// value up to `ttl` old, never older.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            negative_ttl: Duration::from_secs(1),
        }
    }
}

pub struct CachedAccess {
    inner: Arc<dyn DataAccess>,
    config: CacheConfig,
    apps_by_id: TtlCache<String, Option<App>>,
    apps_by_name: TtlCache<String, Option<App>>,
    routes: TtlCache<(String, String), Option<Route>>,
    fns: TtlCache<String, Option<Func>>,
    triggers: TtlCache<(String, String), Option<Trigger>>,
    sf_apps_by_id: Singleflight<String, Option<App>>,
    sf_apps_by_name: Singleflight<String, Option<App>>,
    sf_routes: Singleflight<(String, String), Option<Route>>,
    sf_fns: Singleflight<String, Option<Func>>,
    sf_triggers: Singleflight<(String, String), Option<Trigger>>,
}

impl CachedAccess {
    pub fn new(inner: Arc<dyn DataAccess>, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            apps_by_id: TtlCache::new(config.ttl),
            apps_by_name: TtlCache::new(config.ttl),
            routes: TtlCache::new(config.ttl),
            fns: TtlCache::new(config.ttl),
            triggers: TtlCache::new(config.ttl),
            sf_apps_by_id: Singleflight::new(),
            sf_apps_by_name: Singleflight::new(),
            sf_routes: Singleflight::new(),
            sf_fns: Singleflight::new(),
            sf_triggers: Singleflight::new(),
        }
    }

    /// Fetch-through with singleflight and positive/negative caching.
    async fn lookup<K, V, F, Fut>(
        &self,
        cache: &TtlCache<K, Option<V>>,
        sf: &Singleflight<K, Option<V>>,
        key: K,
        fetch: F,
    ) -> Result<V>
    where
        K: std::hash::Hash + Eq + Clone,
        V: Clone,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        if let Some(entry) = cache.get(&key) {
            return entry.ok_or_else(|| Error::NotFound("cached entity".into()));
        }
        let negative_ttl = self.config.negative_ttl;
        let cache_for_fetch = cache.clone();
        let key_for_fetch = key.clone();
        let entry = sf
            .run(key, || async move {
                match fetch().await {
                    Ok(v) => {
                        cache_for_fetch.insert(key_for_fetch, Some(v.clone()));
                        Ok(Some(v))
                    }
                    Err(Error::NotFound(_)) => {
                        // A negative result is still a result: cache it
                        // briefly and share it with concurrent waiters.
                        cache_for_fetch.insert_with_ttl(key_for_fetch, None, negative_ttl);
                        Ok(None)
                    }
                    Err(other) => Err(other),
                }
            })
            .await;
        match entry {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(Error::NotFound("cached entity".into())),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DataAccess for CachedAccess {
    async fn get_app_by_id(&self, id: &str) -> Result<App> {
        let inner = self.inner.clone();
        let id_owned = id.to_string();
        self.lookup(&self.apps_by_id, &self.sf_apps_by_id, id_owned.clone(), || async move {
            inner.get_app_by_id(&id_owned).await
        })
        .await
    }

    async fn get_app_by_name(&self, name: &str) -> Result<App> {
        let inner = self.inner.clone();
        let name_owned = name.to_string();
        self.lookup(
            &self.apps_by_name,
            &self.sf_apps_by_name,
            name_owned.clone(),
            || async move { inner.get_app_by_name(&name_owned).await },
        )
        .await
    }

    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route> {
        let inner = self.inner.clone();
        let key = (app_name.to_string(), path.to_string());
        let fetch_key = key.clone();
        self.lookup(&self.routes, &self.sf_routes, key, || async move {
            inner.get_route(&fetch_key.0, &fetch_key.1).await
        })
        .await
    }

    async fn get_fn(&self, id: &str) -> Result<Func> {
        let inner = self.inner.clone();
        let id_owned = id.to_string();
        self.lookup(&self.fns, &self.sf_fns, id_owned.clone(), || async move {
            inner.get_fn(&id_owned).await
        })
        .await
    }

    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger> {
        let inner = self.inner.clone();
        let key = (app_id.to_string(), format!("{}:{source}", trigger_type.as_str()));
        let (fetch_app, _) = key.clone();
        let source_owned = source.to_string();
        self.lookup(&self.triggers, &self.sf_triggers, key, || async move {
            inner
                .get_trigger_by_source(&fetch_app, trigger_type, &source_owned)
                .await
        })
        .await
    }

    // Writes pass through untouched; the cache never converts errors to
    // success and holds no call or log state.

    async fn insert_call(&self, call: &Call) -> Result<()> {
        self.inner.insert_call(call).await
    }

    async fn finish_call(&self, call: &Call, log: Bytes) -> Result<()> {
        self.inner.finish_call(call, log).await
    }

    async fn enqueue(&self, call: &Call) -> Result<()> {
        self.inner.enqueue(call).await
    }

    async fn dequeue(&self) -> Result<Option<Call>> {
        self.inner.dequeue().await
    }

    async fn delete_from_queue(&self, call_id: &str) -> Result<()> {
        self.inner.delete_from_queue(call_id).await
    }

    async fn invalidate_app(&self, id: &str) {
        // Learn the app name from the cached value, if any, to scope the
        // dependent-key sweep; otherwise drop everything for safety.
        let name = self
            .apps_by_id
            .get(&id.to_string())
            .flatten()
            .map(|app| app.name);
        self.apps_by_id.remove(&id.to_string());
        match name {
            Some(name) => {
                self.apps_by_name.remove(&name);
                self.routes.retain(|(app, _), _| app != &name);
            }
            None => {
                self.apps_by_name
                    .retain(|_, v| v.as_ref().map(|a| a.id != id).unwrap_or(false));
                self.routes.clear();
            }
        }
        self.fns
            .retain(|_, v| v.as_ref().map(|f| f.app_id != id).unwrap_or(false));
        self.triggers.retain(|(app, _), _| app.as_str() != id);
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DirectAccess, MemDatastore, MemLogStore, MemQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAccess {
        inner: DirectAccess,
        fetches: AtomicUsize,
    }

    impl CountingAccess {
        fn new() -> Self {
            Self {
                inner: DirectAccess::new(
                    Arc::new(MemDatastore::new()),
                    Arc::new(MemLogStore::new()),
                    Arc::new(MemQueue::new()),
                ),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DataAccess for CountingAccess {
        async fn get_app_by_id(&self, id: &str) -> Result<App> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.get_app_by_id(id).await
        }
        async fn get_app_by_name(&self, name: &str) -> Result<App> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.get_app_by_name(name).await
        }
        async fn get_route(&self, app_name: &str, path: &str) -> Result<Route> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.get_route(app_name, path).await
        }
        async fn get_fn(&self, id: &str) -> Result<Func> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.get_fn(id).await
        }
        async fn get_trigger_by_source(
            &self,
            app_id: &str,
            trigger_type: TriggerType,
            source: &str,
        ) -> Result<Trigger> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner
                .get_trigger_by_source(app_id, trigger_type, source)
                .await
        }
        async fn insert_call(&self, call: &Call) -> Result<()> {
            self.inner.insert_call(call).await
        }
        async fn finish_call(&self, call: &Call, log: Bytes) -> Result<()> {
            self.inner.finish_call(call, log).await
        }
        async fn enqueue(&self, call: &Call) -> Result<()> {
            self.inner.enqueue(call).await
        }
        async fn dequeue(&self) -> Result<Option<Call>> {
            self.inner.dequeue().await
        }
        async fn delete_from_queue(&self, call_id: &str) -> Result<()> {
            self.inner.delete_from_queue(call_id).await
        }
    }

    async fn seeded() -> (Arc<CountingAccess>, App) {
        let counting = Arc::new(CountingAccess::new());
        let app = counting
            .inner
            .datastore()
            .insert_app(App::new("myapp"))
            .await
            .unwrap();
        (counting, app)
    }

    #[tokio::test]
    async fn second_read_within_ttl_hits_cache() {
        let (upstream, app) = seeded().await;
        let cached = CachedAccess::new(upstream.clone(), CacheConfig::default());

        cached.get_app_by_id(&app.id).await.unwrap();
        cached.get_app_by_id(&app.id).await.unwrap();
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_refetches() {
        let (upstream, app) = seeded().await;
        let cached = CachedAccess::new(
            upstream.clone(),
            CacheConfig {
                ttl: Duration::from_millis(10),
                negative_ttl: Duration::from_millis(10),
            },
        );
        cached.get_app_by_id(&app.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cached.get_app_by_id(&app.id).await.unwrap();
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let (upstream, app) = seeded().await;
        let cached = Arc::new(CachedAccess::new(upstream.clone(), CacheConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cached = cached.clone();
            let id = app.id.clone();
            handles.push(tokio::spawn(async move { cached.get_app_by_id(&id).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_cached_negatively() {
        let (upstream, _) = seeded().await;
        let cached = CachedAccess::new(upstream.clone(), CacheConfig::default());

        assert!(cached.get_app_by_name("missing").await.is_err());
        assert!(cached.get_app_by_name("missing").await.is_err());
        // Second lookup served from the negative entry.
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_app_forces_fresh_read() {
        let (upstream, app) = seeded().await;
        let cached = CachedAccess::new(upstream.clone(), CacheConfig::default());

        cached.get_app_by_id(&app.id).await.unwrap();
        cached.invalidate_app(&app.id).await;
        cached.get_app_by_id(&app.id).await.unwrap();
        assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_read_within_ttl_then_fresh_after_invalidation() {
        let (upstream, app) = seeded().await;
        let cached = CachedAccess::new(upstream.clone(), CacheConfig::default());

        let before = cached.get_app_by_id(&app.id).await.unwrap();
        assert!(before.config.is_empty());

        // Upstream write lands; the cached value may be served until the
        // TTL or an explicit invalidation.
        let mut updated = app.clone();
        updated.config.insert("K".into(), "V".into());
        upstream
            .inner
            .datastore()
            .update_app(updated)
            .await
            .unwrap();

        let stale = cached.get_app_by_id(&app.id).await.unwrap();
        assert!(stale.config.is_empty());

        cached.invalidate_app(&app.id).await;
        let fresh = cached.get_app_by_id(&app.id).await.unwrap();
        assert_eq!(fresh.config.get("K").map(String::as_str), Some("V"));
    }
}
