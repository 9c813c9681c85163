//! The set of reachable pure-runner endpoints. The default static pool
//! reads a comma-separated address list once; health is observed
//! implicitly through the placers' per-runner failure handling.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use funcd_core::models::Call;
use funcd_core::{Error, Result};
use funcd_grpc::{RunnerClient, TlsMaterial};
use funcd_pool::ContainerResponse;

/// One reachable runner. `Ok(None)` from `try_exec` means the runner
/// rejected the call with a retryable reason.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    fn address(&self) -> &str;
    async fn try_exec(&self, call: &Call, body: Bytes) -> Result<Option<ContainerResponse>>;
}

#[async_trait]
impl Runner for RunnerClient {
    fn address(&self) -> &str {
        RunnerClient::address(self)
    }

    async fn try_exec(&self, call: &Call, body: Bytes) -> Result<Option<ContainerResponse>> {
        RunnerClient::try_exec(self, call, body).await
    }
}

/// Enumerates reachable runners. Snapshots may churn between calls; the
/// pool never rebalances in-flight work.
#[async_trait]
pub trait RunnerPool: Send + Sync + 'static {
    async fn runners(&self) -> Vec<Arc<dyn Runner>>;
    async fn shutdown(&self) {}
}

/// Pool over a fixed address list; the snapshot is constant.
pub struct StaticRunnerPool {
    runners: Vec<Arc<dyn Runner>>,
}

impl StaticRunnerPool {
    /// Build from the `runner-addresses` option.
    pub async fn connect(addresses: &str, tls: Option<&TlsMaterial>) -> Result<Self> {
        let mut runners: Vec<Arc<dyn Runner>> = Vec::new();
        for addr in addresses.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            runners.push(Arc::new(RunnerClient::connect(addr, tls).await?));
        }
        if runners.is_empty() {
            return Err(Error::Fatal("runner-addresses is empty".into()));
        }
        Ok(Self { runners })
    }

    /// Assemble from pre-built runners (tests, custom transports).
    pub fn from_runners(runners: Vec<Arc<dyn Runner>>) -> Self {
        Self { runners }
    }
}

#[async_trait]
impl RunnerPool for StaticRunnerPool {
    async fn runners(&self) -> Vec<Arc<dyn Runner>> {
        self.runners.clone()
    }
}
