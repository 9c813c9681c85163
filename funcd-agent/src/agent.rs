use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use funcd_core::models::{Call, CallStatus, CallUsage};
use funcd_core::{metrics, Error, Result};
use funcd_data::DataAccess;
use funcd_pool::{ContainerRequest, ContainerResponse, ContainerSpec, SlotPool};

/// One in-flight invocation: the resolved call record, the request body,
/// and the token that propagates client disconnects and shutdown.
pub struct Invocation {
    pub call: Call,
    pub body: Bytes,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(call: Call, body: Bytes) -> Self {
        Self {
            call,
            body,
            cancel: CancellationToken::new(),
        }
    }
}

/// The invocation interface every execution role implements: local
/// agents run containers, the LB agent forwards to pure runners.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Synchronous path: run the call, return the container's response.
    /// The call record and log are persisted before this returns.
    async fn submit(&self, inv: &mut Invocation) -> Result<ContainerResponse>;

    /// Async path: persist the call in state `queued` and push it onto
    /// the queue. Returns once the write is durable.
    async fn enqueue(&self, inv: &mut Invocation) -> Result<()>;

    /// Refuse new work, wait for in-flight calls (bounded by the
    /// shutdown timeout), then drain the slot pool.
    async fn close(&self) -> Result<()>;
}

/// Agent for full and runner nodes: executes calls in the local slot
/// pool and persists records through the node's data access.
pub struct LocalAgent {
    da: Arc<dyn DataAccess>,
    pool: SlotPool,
    shutdown_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl LocalAgent {
    pub fn new(da: Arc<dyn DataAccess>, pool: SlotPool, shutdown_timeout: Option<Duration>) -> Self {
        Self {
            da,
            pool,
            shutdown_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Capacity probe for the pure-runner acknowledgement: whether the
    /// call could currently be admitted without waiting.
    pub fn can_admit(&self, memory_mb: u64) -> bool {
        self.pool.memory_used_mb() + memory_mb <= self.pool.memory_total_mb()
    }

    fn spec_for(call: &Call) -> Arc<ContainerSpec> {
        let mut env: Vec<(String, String)> =
            call.config.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.extend(call.platform_env());
        Arc::new(ContainerSpec {
            slot_key: call.slot_key(),
            image: call.image.clone(),
            memory_mb: call.memory,
            cpus_milli: call.cpus,
            format: call.format,
            env,
            idle_timeout: Duration::from_secs(call.idle_timeout),
            metric_label: call.metric_label().to_string(),
        })
    }

    /// Persist the start record. Pure runners carry a nop data access;
    /// their records are owned by the LB side, so unsupported writes are
    /// silently skipped.
    async fn persist_start(&self, call: &Call) -> Result<()> {
        match self.da.insert_call(call).await {
            Err(Error::Unsupported(_)) => Ok(()),
            other => other,
        }
    }

    async fn persist_finish(&self, call: &Call, log: Bytes) -> Result<()> {
        match self.da.finish_call(call, log).await {
            Err(Error::Unsupported(_)) => Ok(()),
            other => other,
        }
    }

    /// Persist a terminal record for a call that never produced output.
    async fn record_failure(&self, call: &mut Call, err: &Error, log: Bytes) {
        call.status = status_for(err);
        call.error = Some(err.to_string());
        call.completed_at = Some(Utc::now());
        metrics::calls_completed()
            .with_label_values(&[call.status.as_str()])
            .inc();
        if let Err(persist_err) = self.persist_finish(call, log).await {
            tracing::error!(call_id = %call.id, error = %persist_err, "failed to persist call failure");
        }
    }
}

/// Terminal status for a failed invocation.
fn status_for(err: &Error) -> CallStatus {
    match err {
        Error::DeadlineExceeded | Error::SlotTimeout | Error::PlacementDeadlineExceeded => {
            CallStatus::Timeout
        }
        _ => CallStatus::Error,
    }
}

#[async_trait]
impl Agent for LocalAgent {
    async fn submit(&self, inv: &mut Invocation) -> Result<ContainerResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NodeDraining);
        }
        let call = &mut inv.call;
        let started = Instant::now();
        let deadline = started + Duration::from_secs(call.timeout);
        let spec = Self::spec_for(call);

        tracing::debug!(call_id = %call.id, slot_key = %spec.slot_key, "submitting call");

        let mut slot = tokio::select! {
            acquired = self.pool.acquire(spec, deadline) => match acquired {
                Ok(slot) => slot,
                Err(e) => {
                    // The record is persisted regardless of how far the
                    // start got, so the call id stays traceable.
                    self.record_failure(call, &e, Bytes::new()).await;
                    return Err(e);
                }
            },
            _ = inv.cancel.cancelled() => {
                call.status = CallStatus::Cancelled;
                call.error = Some("cancelled".into());
                call.completed_at = Some(Utc::now());
                let _ = self.persist_finish(call, Bytes::new()).await;
                return Err(Error::ContainerError("invocation cancelled".into()));
            }
        };

        // Start record: written before any log bytes.
        call.status = CallStatus::Running;
        call.started_at = Some(Utc::now());
        if let Err(e) = self.persist_start(call).await {
            slot.release();
            self.record_failure(call, &e, Bytes::new()).await;
            return Err(e);
        }

        let request = ContainerRequest {
            call_id: call.id.clone(),
            method: call.method.clone(),
            url: call.request_url.clone(),
            headers: call.headers.clone(),
            body: inv.body.clone(),
            deadline,
        };

        let outcome = tokio::select! {
            resp = slot.invoke(request) => resp,
            _ = inv.cancel.cancelled() => {
                // The exchange is half-done; the container cannot be
                // trusted with another holder.
                slot.poison();
                Err(Error::ContainerError("invocation cancelled".into()))
            }
        };

        let log = slot.take_logs();
        slot.release();

        let duration = started.elapsed();
        match outcome {
            Ok(resp) => {
                call.status = CallStatus::Success;
                call.error = None;
                call.completed_at = Some(Utc::now());
                call.usage = Some(CallUsage {
                    memory_mb: call.memory,
                    duration_ms: duration.as_millis() as u64,
                });
                metrics::calls_completed()
                    .with_label_values(&[call.status.as_str()])
                    .inc();
                metrics::call_duration().observe(duration.as_secs_f64());
                self.persist_finish(call, log).await?;
                Ok(resp)
            }
            Err(e) => {
                if inv.cancel.is_cancelled() {
                    call.status = CallStatus::Cancelled;
                    call.error = Some("cancelled".into());
                    call.completed_at = Some(Utc::now());
                    let _ = self.persist_finish(call, log).await;
                } else {
                    self.record_failure(call, &e, log).await;
                }
                tracing::warn!(call_id = %call.id, error = %e, "call failed");
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
        tracing::info!("agent closing, draining slot pool");
        self.pool.close(self.shutdown_timeout).await;
        self.da.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcd_core::models::App;
    use funcd_data::{DirectAccess, Datastore, LogStore, MemDatastore, MemLogStore, MemQueue};
    use funcd_pool::mock::MockDriver;
    use funcd_pool::SlotPoolConfig;

    struct Fixture {
        agent: LocalAgent,
        driver: MockDriver,
        datastore: Arc<MemDatastore>,
        logstore: Arc<MemLogStore>,
    }

    async fn fixture() -> Fixture {
        let datastore = Arc::new(MemDatastore::new());
        let logstore = Arc::new(MemLogStore::new());
        let queue = Arc::new(MemQueue::new());
        datastore.insert_app(App::new("myapp")).await.unwrap();
        let da = Arc::new(DirectAccess::new(
            datastore.clone(),
            logstore.clone(),
            queue,
        ));
        let driver = MockDriver::new();
        let pool = SlotPool::new(Arc::new(driver.clone()), SlotPoolConfig::default());
        Fixture {
            agent: LocalAgent::new(da, pool, Some(Duration::from_secs(1))),
            driver,
            datastore,
            logstore,
        }
    }

    fn call(route: &str) -> Call {
        let mut c = Call::new("app1", "myapp");
        c.route = Some(route.into());
        c.image = "hello:v1".into();
        c.memory = 128;
        c.timeout = 5;
        c.idle_timeout = 30;
        c.request_url = format!("/r/myapp{route}");
        c
    }

    #[tokio::test]
    async fn submit_persists_record_and_log() {
        let fx = fixture().await;
        let mut inv = Invocation::new(call("/hello"), Bytes::from_static(b"ping"));
        let resp = fx.agent.submit(&mut inv).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from_static(b"pong"));

        let record = fx
            .datastore
            .get_call("app1", &inv.call.id)
            .await
            .unwrap();
        assert_eq!(record.status, CallStatus::Success);
        let created = record.created_at;
        let started = record.started_at.expect("started");
        let completed = record.completed_at.expect("completed");
        assert!(created <= started && started <= completed);

        let log = fx.logstore.get_log("app1", &inv.call.id).await.unwrap();
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn second_submit_reuses_the_warm_container() {
        let fx = fixture().await;
        for _ in 0..2 {
            let mut inv = Invocation::new(call("/hello"), Bytes::from_static(b"ping"));
            fx.agent.submit(&mut inv).await.unwrap();
        }
        assert_eq!(fx.driver.launches(), 1);
    }

    #[tokio::test]
    async fn function_error_is_recorded() {
        let fx = fixture().await;
        fx.driver.set_invoke_error(Some(Error::FunctionError {
            exit_code: 3,
            details: "boom".into(),
        }));
        let mut inv = Invocation::new(call("/hello"), Bytes::new());
        let err = fx.agent.submit(&mut inv).await.expect_err("function error");
        assert!(matches!(err, Error::FunctionError { exit_code: 3, .. }));

        let record = fx
            .datastore
            .get_call("app1", &inv.call.id)
            .await
            .unwrap();
        assert_eq!(record.status, CallStatus::Error);
        assert!(record.error.unwrap().contains("exited with code 3"));
    }

    #[tokio::test]
    async fn deadline_hit_records_timeout() {
        let fx = fixture().await;
        fx.driver.set_invoke_delay(Duration::from_secs(10));
        let mut c = call("/slow");
        c.timeout = 1;
        let mut inv = Invocation::new(c, Bytes::new());
        let err = fx.agent.submit(&mut inv).await.expect_err("deadline");
        assert_eq!(err, Error::DeadlineExceeded);

        let record = fx
            .datastore
            .get_call("app1", &inv.call.id)
            .await
            .unwrap();
        assert_eq!(record.status, CallStatus::Timeout);
    }

    #[tokio::test]
    async fn cancelled_invocation_is_recorded_and_container_retired() {
        let fx = fixture().await;
        fx.driver.set_invoke_delay(Duration::from_millis(500));
        let mut inv = Invocation::new(call("/hello"), Bytes::new());
        let cancel = inv.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        fx.agent.submit(&mut inv).await.expect_err("cancelled");
        let record = fx
            .datastore
            .get_call("app1", &inv.call.id)
            .await
            .unwrap();
        assert_eq!(record.status, CallStatus::Cancelled);

        // The poisoned container must not serve the next call.
        fx.driver.set_invoke_delay(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut inv2 = Invocation::new(call("/hello"), Bytes::new());
        fx.agent.submit(&mut inv2).await.unwrap();
        assert_eq!(fx.driver.launches(), 2);
    }

    #[tokio::test]
    async fn closed_agent_refuses_submits() {
        let fx = fixture().await;
        fx.agent.close().await.unwrap();
        let mut inv = Invocation::new(call("/hello"), Bytes::new());
        assert_eq!(
            fx.agent.submit(&mut inv).await.expect_err("draining"),
            Error::NodeDraining
        );
    }

    #[tokio::test]
    async fn enqueue_persists_queued_record() {
        let fx = fixture().await;
        let mut inv = Invocation::new(call("/hello"), Bytes::from_static(b"work"));
        fx.agent.enqueue(&mut inv).await.unwrap();
        let record = fx
            .datastore
            .get_call("app1", &inv.call.id)
            .await
            .unwrap();
        assert_eq!(record.status, CallStatus::Queued);
        assert!(record.payload.is_some());
    }
}
