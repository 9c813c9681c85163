//! The no-catalog data access used on pure-runner nodes: every method
//! reports the operation as unsupported.

use async_trait::async_trait;
use bytes::Bytes;

use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::{Error, Result};

use crate::DataAccess;

#[derive(Debug, Clone, Copy, Default)]
pub struct NopAccess;

impl NopAccess {
    pub fn new() -> Self {
        NopAccess
    }
}

#[async_trait]
impl DataAccess for NopAccess {
    async fn get_app_by_id(&self, _id: &str) -> Result<App> {
        Err(Error::Unsupported("catalog read"))
    }

    async fn get_app_by_name(&self, _name: &str) -> Result<App> {
        Err(Error::Unsupported("catalog read"))
    }

    async fn get_route(&self, _app_name: &str, _path: &str) -> Result<Route> {
        Err(Error::Unsupported("catalog read"))
    }

    async fn get_fn(&self, _id: &str) -> Result<Func> {
        Err(Error::Unsupported("catalog read"))
    }

    async fn get_trigger_by_source(
        &self,
        _app_id: &str,
        _trigger_type: TriggerType,
        _source: &str,
    ) -> Result<Trigger> {
        Err(Error::Unsupported("catalog read"))
    }

    async fn insert_call(&self, _call: &Call) -> Result<()> {
        Err(Error::Unsupported("call persistence"))
    }

    async fn finish_call(&self, _call: &Call, _log: Bytes) -> Result<()> {
        Err(Error::Unsupported("call persistence"))
    }

    async fn enqueue(&self, _call: &Call) -> Result<()> {
        Err(Error::Unsupported("async queue"))
    }

    async fn dequeue(&self) -> Result<Option<Call>> {
        Err(Error::Unsupported("async queue"))
    }

    async fn delete_from_queue(&self, _call_id: &str) -> Result<()> {
        Err(Error::Unsupported("async queue"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn everything_is_unsupported() {
        let nop = NopAccess::new();
        assert!(matches!(
            nop.get_app_by_id("x").await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(nop.dequeue().await, Err(Error::Unsupported(_))));
    }
}
