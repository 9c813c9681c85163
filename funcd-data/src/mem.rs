//! In-memory datastore, log store and queue.
//!
//! The default stores for tests and for `sqlite::memory:`-free local
//! development; the queue is also the production queue for single-node
//! deployments (full nodes), with lease-based redelivery.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use funcd_core::metrics;
use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::{Error, Result};

use crate::{CallFilter, Datastore, LogStore, MessageQueue, Page};

/// Slice a sorted map into a page after `cursor`. The next cursor is the
/// key of the last returned item, present only when further rows exist.
fn paginate<V: Clone>(map: &BTreeMap<String, V>, cursor: Option<&str>, limit: usize) -> Page<V> {
    let range = map.range::<str, _>((
        cursor
            .map(std::ops::Bound::Excluded)
            .unwrap_or(std::ops::Bound::Unbounded),
        std::ops::Bound::Unbounded,
    ));
    let mut items = Vec::with_capacity(limit);
    let mut last_key = None;
    let mut has_more = false;
    for (key, value) in range {
        if items.len() == limit {
            has_more = true;
            break;
        }
        last_key = Some(key.clone());
        items.push(value.clone());
    }
    Page {
        items,
        next_cursor: if has_more { last_key } else { None },
    }
}

#[derive(Default)]
struct StoreInner {
    /// Apps keyed by name (the listing order) plus an id index.
    apps: BTreeMap<String, App>,
    app_names_by_id: HashMap<String, String>,
    /// Routes keyed by `{app_name}\x00{path}`.
    routes: BTreeMap<String, Route>,
    fns: BTreeMap<String, Func>,
    triggers: BTreeMap<String, Trigger>,
    /// Calls keyed by `{app_id}\x00{call_id}`.
    calls: BTreeMap<String, Call>,
}

fn route_key(app_name: &str, path: &str) -> String {
    format!("{app_name}\x00{path}")
}

fn call_key(app_id: &str, call_id: &str) -> String {
    format!("{app_id}\x00{call_id}")
}

/// In-memory catalog store.
#[derive(Default)]
pub struct MemDatastore {
    inner: RwLock<StoreInner>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn insert_app(&self, app: App) -> Result<App> {
        app.validate()?;
        let mut inner = self.inner.write().unwrap();
        if inner.apps.contains_key(&app.name) {
            return Err(Error::Conflict(format!("app {}", app.name)));
        }
        inner.app_names_by_id.insert(app.id.clone(), app.name.clone());
        inner.apps.insert(app.name.clone(), app.clone());
        Ok(app)
    }

    async fn update_app(&self, app: App) -> Result<App> {
        app.validate()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.apps.contains_key(&app.name) {
            return Err(Error::NotFound(format!("app {}", app.name)));
        }
        inner.apps.insert(app.name.clone(), app.clone());
        Ok(app)
    }

    async fn get_app_by_id(&self, id: &str) -> Result<App> {
        let inner = self.inner.read().unwrap();
        inner
            .app_names_by_id
            .get(id)
            .and_then(|name| inner.apps.get(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("app {id}")))
    }

    async fn get_app_by_name(&self, name: &str) -> Result<App> {
        self.inner
            .read()
            .unwrap()
            .apps
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("app {name}")))
    }

    async fn list_apps(&self, cursor: Option<&str>, limit: usize) -> Result<Page<App>> {
        Ok(paginate(&self.inner.read().unwrap().apps, cursor, limit))
    }

    async fn delete_app(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let name = inner
            .app_names_by_id
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("app {id}")))?;
        inner.apps.remove(&name);
        let prefix = format!("{name}\x00");
        inner.routes.retain(|k, _| !k.starts_with(&prefix));
        inner.fns.retain(|_, f| f.app_id != id);
        inner.triggers.retain(|_, t| t.app_id != id);
        Ok(())
    }

    async fn insert_route(&self, route: Route) -> Result<Route> {
        route.validate()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.apps.contains_key(&route.app_name) {
            return Err(Error::NotFound(format!("app {}", route.app_name)));
        }
        let key = route_key(&route.app_name, &route.path);
        if inner.routes.contains_key(&key) {
            return Err(Error::Conflict(format!("route {}", route.path)));
        }
        inner.routes.insert(key, route.clone());
        Ok(route)
    }

    async fn update_route(&self, route: Route) -> Result<Route> {
        route.validate()?;
        let mut inner = self.inner.write().unwrap();
        let key = route_key(&route.app_name, &route.path);
        if !inner.routes.contains_key(&key) {
            return Err(Error::NotFound(format!("route {}", route.path)));
        }
        inner.routes.insert(key, route.clone());
        Ok(route)
    }

    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route> {
        self.inner
            .read()
            .unwrap()
            .routes
            .get(&route_key(app_name, path))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("route {path}")))
    }

    async fn list_routes(
        &self,
        app_name: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Route>> {
        let inner = self.inner.read().unwrap();
        let prefix = format!("{app_name}\x00");
        let scoped: BTreeMap<String, Route> = inner
            .routes
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect();
        Ok(paginate(&scoped, cursor, limit))
    }

    async fn delete_route(&self, app_name: &str, path: &str) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .routes
            .remove(&route_key(app_name, path))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("route {path}")))
    }

    async fn insert_fn(&self, f: Func) -> Result<Func> {
        f.validate()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.app_names_by_id.contains_key(&f.app_id) {
            return Err(Error::NotFound(format!("app {}", f.app_id)));
        }
        if inner
            .fns
            .values()
            .any(|x| x.app_id == f.app_id && x.name == f.name)
        {
            return Err(Error::Conflict(format!("fn {}", f.name)));
        }
        inner.fns.insert(f.id.clone(), f.clone());
        Ok(f)
    }

    async fn update_fn(&self, f: Func) -> Result<Func> {
        f.validate()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.fns.contains_key(&f.id) {
            return Err(Error::NotFound(format!("fn {}", f.id)));
        }
        inner.fns.insert(f.id.clone(), f.clone());
        Ok(f)
    }

    async fn get_fn(&self, id: &str) -> Result<Func> {
        self.inner
            .read()
            .unwrap()
            .fns
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("fn {id}")))
    }

    async fn list_fns(&self, app_id: &str, cursor: Option<&str>, limit: usize) -> Result<Page<Func>> {
        let inner = self.inner.read().unwrap();
        let scoped: BTreeMap<String, Func> = inner
            .fns
            .iter()
            .filter(|(_, f)| f.app_id == app_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(paginate(&scoped, cursor, limit))
    }

    async fn delete_fn(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .fns
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("fn {id}")))?;
        inner.triggers.retain(|_, t| t.fn_id != id);
        Ok(())
    }

    async fn insert_trigger(&self, t: Trigger) -> Result<Trigger> {
        t.validate()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.app_names_by_id.contains_key(&t.app_id) {
            return Err(Error::NotFound(format!("app {}", t.app_id)));
        }
        if !inner.fns.contains_key(&t.fn_id) {
            return Err(Error::NotFound(format!("fn {}", t.fn_id)));
        }
        if inner
            .triggers
            .values()
            .any(|x| x.app_id == t.app_id && (x.name == t.name || x.source == t.source))
        {
            return Err(Error::Conflict(format!("trigger {}", t.name)));
        }
        inner.triggers.insert(t.id.clone(), t.clone());
        Ok(t)
    }

    async fn update_trigger(&self, t: Trigger) -> Result<Trigger> {
        t.validate()?;
        let mut inner = self.inner.write().unwrap();
        if !inner.triggers.contains_key(&t.id) {
            return Err(Error::NotFound(format!("trigger {}", t.id)));
        }
        inner.triggers.insert(t.id.clone(), t.clone());
        Ok(t)
    }

    async fn get_trigger(&self, id: &str) -> Result<Trigger> {
        self.inner
            .read()
            .unwrap()
            .triggers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("trigger {id}")))
    }

    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger> {
        self.inner
            .read()
            .unwrap()
            .triggers
            .values()
            .find(|t| t.app_id == app_id && t.trigger_type == trigger_type && t.source == source)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("trigger {source}")))
    }

    async fn list_triggers(
        &self,
        app_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Trigger>> {
        let inner = self.inner.read().unwrap();
        let scoped: BTreeMap<String, Trigger> = inner
            .triggers
            .iter()
            .filter(|(_, t)| t.app_id == app_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(paginate(&scoped, cursor, limit))
    }

    async fn delete_trigger(&self, id: &str) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .triggers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("trigger {id}")))
    }

    async fn insert_call(&self, call: &Call) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = call_key(&call.app_id, &call.id);
        // A redelivered async attempt must not resurrect a completed
        // record.
        if let Some(existing) = inner.calls.get(&key) {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }
        inner.calls.insert(key, call.clone());
        Ok(())
    }

    async fn update_call(&self, call: &Call) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = call_key(&call.app_id, &call.id);
        if let Some(existing) = inner.calls.get(&key) {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }
        inner.calls.insert(key, call.clone());
        Ok(())
    }

    async fn get_call(&self, app_id: &str, call_id: &str) -> Result<Call> {
        self.inner
            .read()
            .unwrap()
            .calls
            .get(&call_key(app_id, call_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("call {call_id}")))
    }

    async fn list_calls(&self, filter: &CallFilter) -> Result<Page<Call>> {
        let inner = self.inner.read().unwrap();
        let prefix = format!("{}\x00", filter.app_id);
        let scoped: BTreeMap<String, Call> = inner
            .calls
            .iter()
            .filter(|(k, c)| {
                k.starts_with(&prefix)
                    && filter
                        .route
                        .as_ref()
                        .map(|r| c.route.as_deref() == Some(r.as_str()))
                        .unwrap_or(true)
            })
            .map(|(_, c)| (c.id.clone(), c.clone()))
            .collect();
        Ok(paginate(&scoped, filter.cursor.as_deref(), filter.per_page))
    }
}

/// In-memory log blobs keyed by (app id, call id).
#[derive(Default)]
pub struct MemLogStore {
    logs: RwLock<HashMap<String, Bytes>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn insert_log(&self, app_id: &str, call_id: &str, log: Bytes) -> Result<()> {
        self.logs
            .write()
            .unwrap()
            .insert(call_key(app_id, call_id), log);
        Ok(())
    }

    async fn get_log(&self, app_id: &str, call_id: &str) -> Result<Bytes> {
        self.logs
            .read()
            .unwrap()
            .get(&call_key(app_id, call_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("log for call {call_id}")))
    }
}

struct Reserved {
    call: Call,
    lease_expires: Instant,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Call>,
    reserved: HashMap<String, Reserved>,
}

/// Lease-queue with at-least-once delivery.
///
/// `dequeue` hands out a lease; a message whose lease expires without a
/// `delete` goes back to the front of the ready queue and is redelivered.
pub struct MemQueue {
    inner: Mutex<QueueInner>,
    lease: Duration,
}

/// Default reservation lease before an undeleted message is redelivered.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

impl MemQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            lease,
        }
    }

    fn reclaim_expired(inner: &mut QueueInner) {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .reserved
            .iter()
            .filter(|(_, r)| r.lease_expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(r) = inner.reserved.remove(&id) {
                tracing::warn!(call_id = %id, "queue lease expired, redelivering");
                inner.ready.push_front(r.call);
            }
        }
    }
}

impl Default for MemQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemQueue {
    async fn enqueue(&self, call: &Call) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ready.push_back(call.clone());
        metrics::queue_depth().set(inner.ready.len() as i64);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Call>> {
        let mut inner = self.inner.lock().unwrap();
        Self::reclaim_expired(&mut inner);
        let next = inner.ready.pop_front();
        if let Some(call) = &next {
            inner.reserved.insert(
                call.id.clone(),
                Reserved {
                    call: call.clone(),
                    lease_expires: Instant::now() + self.lease,
                },
            );
        }
        metrics::queue_depth().set(inner.ready.len() as i64);
        Ok(next)
    }

    async fn delete(&self, call_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reserved.remove(call_id).is_none() {
            inner.ready.retain(|c| c.id != call_id);
        }
        metrics::queue_depth().set(inner.ready.len() as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcd_core::models::{Format, RouteType};

    fn call(id: &str) -> Call {
        let mut c = Call::new("app1", "myapp");
        c.id = id.into();
        c.image = "img".into();
        c
    }

    #[tokio::test]
    async fn app_crud_round_trip() {
        let ds = MemDatastore::new();
        let app = ds.insert_app(App::new("myapp")).await.unwrap();
        assert_eq!(ds.get_app_by_id(&app.id).await.unwrap().name, "myapp");
        assert_eq!(ds.get_app_by_name("myapp").await.unwrap().id, app.id);
        ds.delete_app(&app.id).await.unwrap();
        assert!(matches!(
            ds.get_app_by_id(&app.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_app_conflicts() {
        let ds = MemDatastore::new();
        ds.insert_app(App::new("a")).await.unwrap();
        assert!(matches!(
            ds.insert_app(App::new("a")).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn delete_app_cascades() {
        let ds = MemDatastore::new();
        let app = ds.insert_app(App::new("a")).await.unwrap();
        let now = chrono::Utc::now();
        let mut route = Route {
            app_name: "a".into(),
            path: "/hello".into(),
            image: "img".into(),
            memory: 128,
            cpus: 0,
            timeout: 30,
            idle_timeout: 30,
            route_type: RouteType::Sync,
            format: Format::Default,
            config: Default::default(),
            created_at: now,
            updated_at: now,
        };
        route.apply_defaults();
        ds.insert_route(route).await.unwrap();
        let f = ds.insert_fn(Func::new(&app.id, "f1", "img")).await.unwrap();
        ds.insert_trigger(Trigger::new(&app.id, &f.id, "t1", "/hook"))
            .await
            .unwrap();

        ds.delete_app(&app.id).await.unwrap();
        assert!(ds.get_route("a", "/hello").await.is_err());
        assert!(ds.get_fn(&f.id).await.is_err());
        assert!(ds
            .get_trigger_by_source(&app.id, TriggerType::Http, "/hook")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn pagination_walks_in_order() {
        let ds = MemDatastore::new();
        for name in ["a", "b", "c", "d", "e"] {
            ds.insert_app(App::new(name)).await.unwrap();
        }
        let first = ds.list_apps(None, 2).await.unwrap();
        assert_eq!(
            first.items.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        let cursor = first.next_cursor.expect("more pages");
        let second = ds.list_apps(Some(&cursor), 2).await.unwrap();
        assert_eq!(
            second.items.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            ["c", "d"]
        );
        let cursor = second.next_cursor.expect("more pages");
        let third = ds.list_apps(Some(&cursor), 2).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn terminal_call_records_are_immutable() {
        let ds = MemDatastore::new();
        let mut c = call("c1");
        c.status = funcd_core::models::CallStatus::Success;
        ds.insert_call(&c).await.unwrap();

        let mut overwrite = c.clone();
        overwrite.status = funcd_core::models::CallStatus::Error;
        ds.update_call(&overwrite).await.unwrap();
        assert_eq!(
            ds.get_call("app1", "c1").await.unwrap().status,
            funcd_core::models::CallStatus::Success
        );
    }

    #[tokio::test]
    async fn queue_delivers_once_when_deleted() {
        let q = MemQueue::new();
        q.enqueue(&call("c1")).await.unwrap();
        let got = q.dequeue().await.unwrap().expect("message");
        assert_eq!(got.id, "c1");
        q.delete("c1").await.unwrap();
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_redelivers_after_lease_expiry() {
        let q = MemQueue::with_lease(Duration::from_millis(10));
        q.enqueue(&call("c1")).await.unwrap();
        assert!(q.dequeue().await.unwrap().is_some());
        // Not deleted; lease expires.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let redelivered = q.dequeue().await.unwrap().expect("redelivery");
        assert_eq!(redelivered.id, "c1");
        q.delete("c1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_store_round_trip() {
        let ls = MemLogStore::new();
        ls.insert_log("a", "c", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(ls.get_log("a", "c").await.unwrap(), Bytes::from_static(b"hello"));
        assert!(ls.get_log("a", "missing").await.is_err());
    }
}
