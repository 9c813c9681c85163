//! Direct data access: binds the node-local datastore, log store and
//! queue. Used on full and API nodes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::Result;

use crate::{DataAccess, Datastore, LogStore, MessageQueue};

#[derive(Clone)]
pub struct DirectAccess {
    datastore: Arc<dyn Datastore>,
    logstore: Arc<dyn LogStore>,
    queue: Arc<dyn MessageQueue>,
}

impl DirectAccess {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        logstore: Arc<dyn LogStore>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            datastore,
            logstore,
            queue,
        }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn logstore(&self) -> &Arc<dyn LogStore> {
        &self.logstore
    }
}

#[async_trait]
impl DataAccess for DirectAccess {
    async fn get_app_by_id(&self, id: &str) -> Result<App> {
        self.datastore.get_app_by_id(id).await
    }

    async fn get_app_by_name(&self, name: &str) -> Result<App> {
        self.datastore.get_app_by_name(name).await
    }

    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route> {
        self.datastore.get_route(app_name, path).await
    }

    async fn get_fn(&self, id: &str) -> Result<Func> {
        self.datastore.get_fn(id).await
    }

    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger> {
        self.datastore
            .get_trigger_by_source(app_id, trigger_type, source)
            .await
    }

    async fn insert_call(&self, call: &Call) -> Result<()> {
        self.datastore.insert_call(call).await
    }

    async fn finish_call(&self, call: &Call, log: Bytes) -> Result<()> {
        // Log bytes land before the completion record so a reader that
        // observes the terminal status always finds the log.
        if !log.is_empty() {
            self.logstore.insert_log(&call.app_id, &call.id, log).await?;
        }
        self.datastore.update_call(call).await
    }

    async fn enqueue(&self, call: &Call) -> Result<()> {
        self.datastore.insert_call(call).await?;
        self.queue.enqueue(call).await
    }

    async fn dequeue(&self) -> Result<Option<Call>> {
        self.queue.dequeue().await
    }

    async fn delete_from_queue(&self, call_id: &str) -> Result<()> {
        self.queue.delete(call_id).await
    }
}
