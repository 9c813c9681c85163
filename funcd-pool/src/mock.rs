//! Mock container driver: the test double used across the workspace.
//! Launches instantly, answers `pong` by default, and can be steered to
//! delay, fail launches or fail invocations.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use funcd_core::{Error, Result};

use crate::driver::{ContainerDriver, ContainerHandle, ContainerRequest, ContainerResponse, ContainerSpec};

type Responder = Arc<dyn Fn(&ContainerRequest) -> ContainerResponse + Send + Sync>;

struct MockState {
    launches: AtomicUsize,
    fail_launches: AtomicBool,
    launch_delay_ms: AtomicU64,
    invoke_delay_ms: AtomicU64,
    invoke_error: Mutex<Option<Error>>,
    responder: RwLock<Responder>,
}

#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                launches: AtomicUsize::new(0),
                fail_launches: AtomicBool::new(false),
                launch_delay_ms: AtomicU64::new(0),
                invoke_delay_ms: AtomicU64::new(0),
                invoke_error: Mutex::new(None),
                responder: RwLock::new(Arc::new(|_req: &ContainerRequest| ContainerResponse {
                    status: 200,
                    headers: vec![("content-type".into(), "text/plain".into())],
                    body: Bytes::from_static(b"pong"),
                })),
            }),
        }
    }

    pub fn with_invoke_delay(self, delay: Duration) -> Self {
        self.set_invoke_delay(delay);
        self
    }

    pub fn with_launch_delay(self, delay: Duration) -> Self {
        self.state
            .launch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn with_responder(
        self,
        f: impl Fn(&ContainerRequest) -> ContainerResponse + Send + Sync + 'static,
    ) -> Self {
        *self.state.responder.write().unwrap() = Arc::new(f);
        self
    }

    pub fn set_invoke_delay(&self, delay: Duration) {
        self.state
            .invoke_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.state.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent invoke fail with `err` and mark the
    /// container unhealthy.
    pub fn set_invoke_error(&self, err: Option<Error>) {
        *self.state.invoke_error.lock().unwrap() = err;
    }

    /// Total containers launched by this driver.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn launch(&self, _spec: &ContainerSpec) -> Result<Box<dyn ContainerHandle>> {
        let delay = self.state.launch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_launches.load(Ordering::SeqCst) {
            return Err(Error::ContainerError("mock launch failure".into()));
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContainer {
            state: self.state.clone(),
            healthy: true,
            logs: Vec::new(),
        }))
    }
}

struct MockContainer {
    state: Arc<MockState>,
    healthy: bool,
    logs: Vec<u8>,
}

#[async_trait]
impl ContainerHandle for MockContainer {
    async fn invoke(&mut self, req: ContainerRequest) -> Result<ContainerResponse> {
        // Pessimistic health, matching the docker driver: only a
        // completed exchange restores the flag.
        self.healthy = false;
        if let Some(err) = self.state.invoke_error.lock().unwrap().clone() {
            return Err(err);
        }
        let delay = Duration::from_millis(self.state.invoke_delay_ms.load(Ordering::SeqCst));
        if tokio::time::timeout_at(req.deadline, tokio::time::sleep(delay))
            .await
            .is_err()
        {
            return Err(Error::DeadlineExceeded);
        }
        self.logs
            .extend_from_slice(format!("call {} handled\n", req.call_id).as_bytes());
        let responder = self.state.responder.read().unwrap().clone();
        self.healthy = true;
        Ok(responder(&req))
    }

    fn take_logs(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.logs))
    }

    fn healthy(&self) -> bool {
        self.healthy
    }

    async fn terminate(self: Box<Self>, _grace: Duration) {}
}
