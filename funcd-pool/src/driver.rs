//! The container supervisor interface the pool launches slots through.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use funcd_core::models::Format;
use funcd_core::{Result, SlotKey};

/// Everything needed to start a container for one slot key. Two specs
/// with the same slot key are interchangeable.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub slot_key: SlotKey,
    pub image: String,
    pub memory_mb: u64,
    /// CPU shares in milli-CPUs; 0 means unconstrained.
    pub cpus_milli: u64,
    pub format: Format,
    /// Container environment: merged function config plus platform vars.
    pub env: Vec<(String, String)>,
    /// How long a slot may sit idle before eviction.
    pub idle_timeout: Duration,
    /// Route path / fn id, for per-function metric families.
    pub metric_label: String,
}

/// One framed exchange with a warm container.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub call_id: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Absolute deadline for the exchange.
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct ContainerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A running container. The holder has exclusive use between
/// `invoke` calls; the pool guarantees no concurrent holders.
#[async_trait]
pub trait ContainerHandle: Send {
    /// Write the request frame, read the response frame. An I/O failure
    /// or deadline hit marks the container unhealthy.
    async fn invoke(&mut self, req: ContainerRequest) -> Result<ContainerResponse>;

    /// Drain everything the function wrote to stderr since the last call.
    fn take_logs(&mut self) -> Bytes;

    /// Whether the container can serve another invocation.
    fn healthy(&self) -> bool;

    /// Stop the container: polite signal, then kill after `grace`.
    /// Returns once the exit is confirmed.
    async fn terminate(self: Box<Self>, grace: Duration);
}

/// Launches containers. Implementations: [`docker`](crate::docker) for
/// production, [`mock`](crate::mock) for tests.
#[async_trait]
pub trait ContainerDriver: Send + Sync + 'static {
    async fn launch(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerHandle>>;
}
