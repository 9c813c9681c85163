//! The LB agent: cached data access + runner pool + placer composed
//! into the invocation pipeline. Metadata is resolved by the HTTP layer
//! before submit; this agent places, streams, and records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use funcd_agent::{Agent, Invocation};
use funcd_core::models::{CallStatus, CallUsage};
use funcd_core::{metrics, Error, Result};
use funcd_data::DataAccess;
use funcd_pool::ContainerResponse;

use crate::placer::Placer;
use crate::pool::RunnerPool;

pub struct LbAgent {
    da: Arc<dyn DataAccess>,
    pool: Arc<dyn RunnerPool>,
    placer: Arc<dyn Placer>,
    closed: AtomicBool,
}

impl LbAgent {
    pub fn new(da: Arc<dyn DataAccess>, pool: Arc<dyn RunnerPool>, placer: Arc<dyn Placer>) -> Self {
        Self {
            da,
            pool,
            placer,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Agent for LbAgent {
    async fn submit(&self, inv: &mut Invocation) -> Result<ContainerResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NodeDraining);
        }
        let started = std::time::Instant::now();

        inv.call.status = CallStatus::Running;
        inv.call.started_at = Some(Utc::now());
        self.da.insert_call(&inv.call).await?;

        let runners = self.pool.runners().await;
        tracing::debug!(call_id = %inv.call.id, runners = runners.len(), "placing call");
        let outcome = self.placer.place(inv, &runners).await;

        match outcome {
            Ok(resp) => {
                inv.call.status = CallStatus::Success;
                inv.call.completed_at = Some(Utc::now());
                inv.call.usage = Some(CallUsage {
                    memory_mb: inv.call.memory,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                metrics::calls_completed()
                    .with_label_values(&[inv.call.status.as_str()])
                    .inc();
                self.da.finish_call(&inv.call, Bytes::new()).await?;
                Ok(resp)
            }
            Err(e) => {
                inv.call.status = match e {
                    Error::PlacementDeadlineExceeded | Error::DeadlineExceeded | Error::SlotTimeout => {
                        CallStatus::Timeout
                    }
                    _ => CallStatus::Error,
                };
                inv.call.error = Some(e.to_string());
                inv.call.completed_at = Some(Utc::now());
                metrics::calls_completed()
                    .with_label_values(&[inv.call.status.as_str()])
                    .inc();
                if let Err(persist) = self.da.finish_call(&inv.call, Bytes::new()).await {
                    tracing::error!(call_id = %inv.call.id, error = %persist, "failed to record placement failure");
                }
                tracing::warn!(call_id = %inv.call.id, error = %e, "placement failed");
                Err(e)
            }
        }
    }

    async fn enqueue(&self, inv: &mut Invocation) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NodeDraining);
        }
        let call = &mut inv.call;
        call.status = CallStatus::Queued;
        if !inv.body.is_empty() {
            call.payload = Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                &inv.body,
            ));
        }
        self.da.enqueue(call).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.shutdown().await;
        self.da.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naive::NaivePlacer;
    use crate::pool::{Runner, StaticRunnerPool};
    use funcd_core::models::{App, Call};
    use funcd_data::{Datastore, DirectAccess, MemDatastore, MemLogStore, MemQueue};

    struct AcceptingRunner;

    #[async_trait]
    impl Runner for AcceptingRunner {
        fn address(&self) -> &str {
            "r1:9190"
        }

        async fn try_exec(
            &self,
            _call: &Call,
            body: Bytes,
        ) -> Result<Option<ContainerResponse>> {
            Ok(Some(ContainerResponse {
                status: 200,
                headers: Vec::new(),
                body,
            }))
        }
    }

    #[tokio::test]
    async fn submit_places_and_records_the_call() {
        let datastore = Arc::new(MemDatastore::new());
        datastore.insert_app(App::new("myapp")).await.unwrap();
        let da = Arc::new(DirectAccess::new(
            datastore.clone(),
            Arc::new(MemLogStore::new()),
            Arc::new(MemQueue::new()),
        ));
        let pool = Arc::new(StaticRunnerPool::from_runners(vec![Arc::new(AcceptingRunner)]));
        let agent = LbAgent::new(da, pool, Arc::new(NaivePlacer::new()));

        let mut call = Call::new("app1", "myapp");
        call.image = "img".into();
        call.timeout = 30;
        let mut inv = Invocation::new(call, Bytes::from_static(b"echo"));
        let resp = agent.submit(&mut inv).await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"echo"));

        let record = datastore.get_call("app1", &inv.call.id).await.unwrap();
        assert_eq!(record.status, CallStatus::Success);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn closed_lb_agent_refuses_work() {
        let da = Arc::new(DirectAccess::new(
            Arc::new(MemDatastore::new()),
            Arc::new(MemLogStore::new()),
            Arc::new(MemQueue::new()),
        ));
        let pool = Arc::new(StaticRunnerPool::from_runners(vec![Arc::new(AcceptingRunner)]));
        let agent = LbAgent::new(da, pool, Arc::new(NaivePlacer::new()));
        agent.close().await.unwrap();

        let mut inv = Invocation::new(Call::new("a", "a"), Bytes::new());
        assert_eq!(
            agent.submit(&mut inv).await.expect_err("draining"),
            Error::NodeDraining
        );
    }
}
