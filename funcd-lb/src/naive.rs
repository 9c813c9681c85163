//! Naive placer: rotate through the snapshot from a random offset,
//! giving each runner a bounded number of attempts.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use funcd_agent::Invocation;
use funcd_core::{Error, Result};
use funcd_pool::ContainerResponse;

use crate::placer::{attempt, check_deadline, Attempt, Placer};
use crate::pool::Runner;

pub struct NaivePlacer {
    per_runner_budget: usize,
}

impl NaivePlacer {
    pub fn new() -> Self {
        Self {
            per_runner_budget: 3,
        }
    }

    pub fn with_budget(per_runner_budget: usize) -> Self {
        Self { per_runner_budget }
    }
}

impl Default for NaivePlacer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Placer for NaivePlacer {
    async fn place(
        &self,
        inv: &mut Invocation,
        runners: &[Arc<dyn Runner>],
    ) -> Result<ContainerResponse> {
        if runners.is_empty() {
            return Err(Error::ResourceUnavailable);
        }
        let offset = rand::thread_rng().gen_range(0..runners.len());
        // At most N runners x B rounds attempts in total.
        for _ in 0..self.per_runner_budget {
            for i in 0..runners.len() {
                check_deadline(inv)?;
                let runner = &runners[(offset + i) % runners.len()];
                match attempt(runner, inv).await {
                    Attempt::Placed(resp) => return Ok(resp),
                    Attempt::Rejected => continue,
                    Attempt::Failed(e) => return Err(e),
                }
            }
        }
        Err(Error::ResourceUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Runner;
    use bytes::Bytes;
    use funcd_core::models::Call;
    use funcd_pool::ContainerResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) enum Script {
        Accept,
        Reject,
        Fail,
    }

    pub(crate) struct FakeRunner {
        addr: String,
        script: Script,
        pub attempts: AtomicUsize,
    }

    impl FakeRunner {
        pub(crate) fn new(addr: &str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                addr: addr.into(),
                script,
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Runner for FakeRunner {
        fn address(&self) -> &str {
            &self.addr
        }

        async fn try_exec(
            &self,
            _call: &Call,
            _body: Bytes,
        ) -> funcd_core::Result<Option<ContainerResponse>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Accept => Ok(Some(ContainerResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"pong"),
                })),
                Script::Reject => Ok(None),
                Script::Fail => Err(Error::ContainerError("broken runner".into())),
            }
        }
    }

    fn invocation() -> Invocation {
        let mut call = Call::new("app1", "myapp");
        call.image = "img".into();
        call.timeout = 30;
        Invocation::new(call, Bytes::from_static(b"ping"))
    }

    #[tokio::test]
    async fn falls_through_rejections_to_an_accepting_runner() {
        let r1 = FakeRunner::new("r1", Script::Reject);
        let r2 = FakeRunner::new("r2", Script::Accept);
        let runners: Vec<Arc<dyn Runner>> = vec![r1.clone(), r2.clone()];

        let placer = NaivePlacer::new();
        let resp = placer.place(&mut invocation(), &runners).await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"pong"));
        assert_eq!(r2.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_count_is_bounded_by_runners_times_budget() {
        let fakes: Vec<Arc<FakeRunner>> = (0..3)
            .map(|i| FakeRunner::new(&format!("r{i}"), Script::Reject))
            .collect();
        let runners: Vec<Arc<dyn Runner>> = fakes.iter().map(|r| r.clone() as _).collect();

        let placer = NaivePlacer::with_budget(2);
        let err = placer
            .place(&mut invocation(), &runners)
            .await
            .expect_err("everyone rejects");
        assert_eq!(err, Error::ResourceUnavailable);

        let total: usize = fakes.iter().map(|r| r.attempts.load(Ordering::SeqCst)).sum();
        assert!(total <= 3 * 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_placement() {
        let r1 = FakeRunner::new("r1", Script::Fail);
        let r2 = FakeRunner::new("r2", Script::Accept);
        let runners: Vec<Arc<dyn Runner>> = vec![r1, r2.clone()];

        // Offset is random; force determinism by using one failing runner.
        let placer = NaivePlacer::new();
        let only_fail: Vec<Arc<dyn Runner>> = vec![runners[0].clone()];
        let err = placer
            .place(&mut invocation(), &only_fail)
            .await
            .expect_err("hard failure");
        assert!(matches!(err, Error::ContainerError(_)));
    }

    #[tokio::test]
    async fn exhausted_deadline_fails_placement() {
        let r1 = FakeRunner::new("r1", Script::Accept);
        let runners: Vec<Arc<dyn Runner>> = vec![r1];

        let mut inv = invocation();
        inv.call.timeout = 1;
        inv.call.created_at = chrono::Utc::now() - chrono::Duration::seconds(5);

        let placer = NaivePlacer::new();
        let err = placer.place(&mut inv, &runners).await.expect_err("too late");
        assert_eq!(err, Error::PlacementDeadlineExceeded);
    }
}
