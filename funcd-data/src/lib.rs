//! The data-access layer: one capability set over catalog, queue and log
//! store, with four interchangeable implementations.
//!
//! - [`DirectAccess`] binds local stores (full and API nodes).
//! - [`HybridClient`] speaks HTTP+JSON to an API node (runner and LB nodes).
//! - [`CachedAccess`] wraps either with a short-TTL cache and per-key
//!   singleflight.
//! - [`NopAccess`] rejects everything (pure-runner nodes hold no catalog).

pub mod cached;
pub mod direct;
pub mod hybrid;
pub mod mem;
pub mod nop;
pub mod sql;

pub use cached::{CacheConfig, CachedAccess};
pub use direct::DirectAccess;
pub use hybrid::HybridClient;
pub use mem::{MemDatastore, MemLogStore, MemQueue};
pub use nop::NopAccess;
pub use sql::SqlStore;

use async_trait::async_trait;
use bytes::Bytes;

use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::Result;

/// A page of results plus the cursor for the next one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Page {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// List-call filter accepted by the call endpoints.
#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    pub app_id: String,
    pub route: Option<String>,
    pub cursor: Option<String>,
    pub per_page: usize,
}

/// Maximum page size accepted from clients.
pub const MAX_PER_PAGE: usize = 100;

/// Clamp a requested page size into `1..=MAX_PER_PAGE` (0 means default 30).
pub fn clamp_per_page(requested: usize) -> usize {
    match requested {
        0 => 30,
        n => n.min(MAX_PER_PAGE),
    }
}

/// The authoritative catalog store owned by the API tier.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    // Applications.
    async fn insert_app(&self, app: App) -> Result<App>;
    async fn update_app(&self, app: App) -> Result<App>;
    async fn get_app_by_id(&self, id: &str) -> Result<App>;
    async fn get_app_by_name(&self, name: &str) -> Result<App>;
    async fn list_apps(&self, cursor: Option<&str>, limit: usize) -> Result<Page<App>>;
    /// Deletes the app and cascades to its routes, fns and triggers.
    async fn delete_app(&self, id: &str) -> Result<()>;

    // Routes (v1).
    async fn insert_route(&self, route: Route) -> Result<Route>;
    async fn update_route(&self, route: Route) -> Result<Route>;
    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route>;
    async fn list_routes(&self, app_name: &str, cursor: Option<&str>, limit: usize)
        -> Result<Page<Route>>;
    async fn delete_route(&self, app_name: &str, path: &str) -> Result<()>;

    // Functions (v2).
    async fn insert_fn(&self, f: Func) -> Result<Func>;
    async fn update_fn(&self, f: Func) -> Result<Func>;
    async fn get_fn(&self, id: &str) -> Result<Func>;
    async fn list_fns(&self, app_id: &str, cursor: Option<&str>, limit: usize) -> Result<Page<Func>>;
    async fn delete_fn(&self, id: &str) -> Result<()>;

    // Triggers.
    async fn insert_trigger(&self, t: Trigger) -> Result<Trigger>;
    async fn update_trigger(&self, t: Trigger) -> Result<Trigger>;
    async fn get_trigger(&self, id: &str) -> Result<Trigger>;
    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger>;
    async fn list_triggers(&self, app_id: &str, cursor: Option<&str>, limit: usize)
        -> Result<Page<Trigger>>;
    async fn delete_trigger(&self, id: &str) -> Result<()>;

    // Call records.
    async fn insert_call(&self, call: &Call) -> Result<()>;
    /// Upserts; a record that is already terminal is left untouched so
    /// redelivered async calls cannot overwrite a completed attempt.
    async fn update_call(&self, call: &Call) -> Result<()>;
    async fn get_call(&self, app_id: &str, call_id: &str) -> Result<Call>;
    async fn list_calls(&self, filter: &CallFilter) -> Result<Page<Call>>;
}

/// Opaque per-call log blobs.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    async fn insert_log(&self, app_id: &str, call_id: &str, log: Bytes) -> Result<()>;
    async fn get_log(&self, app_id: &str, call_id: &str) -> Result<Bytes>;
}

/// The async call queue. Delivery is at-least-once: a reserved message
/// that is never deleted is redelivered after its lease expires, and
/// consumers dedup by call id.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    async fn enqueue(&self, call: &Call) -> Result<()>;
    /// Reserve the next message, or `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<Call>>;
    async fn delete(&self, call_id: &str) -> Result<()>;
}

/// The unified capability set every node role reads and writes through:
/// catalog reads, call record writes, log writes and the async queue.
#[async_trait]
pub trait DataAccess: Send + Sync + 'static {
    async fn get_app_by_id(&self, id: &str) -> Result<App>;
    async fn get_app_by_name(&self, name: &str) -> Result<App>;
    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route>;
    async fn get_fn(&self, id: &str) -> Result<Func>;
    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger>;

    /// Persist the start record. Written before any log bytes.
    async fn insert_call(&self, call: &Call) -> Result<()>;
    /// Persist the log blob and then the completion record, in that order.
    async fn finish_call(&self, call: &Call, log: Bytes) -> Result<()>;

    async fn enqueue(&self, call: &Call) -> Result<()>;
    async fn dequeue(&self) -> Result<Option<Call>>;
    async fn delete_from_queue(&self, call_id: &str) -> Result<()>;

    /// Drop any cached state for the app. No-op except on [`CachedAccess`].
    async fn invalidate_app(&self, _id: &str) {}

    /// Release held resources; called once during node shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
