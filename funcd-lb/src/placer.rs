//! The placement interface: a policy mapping (invocation, snapshot,
//! load state) to a runner, retrying within the invocation's deadline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use funcd_agent::Invocation;
use funcd_core::{metrics, Error, Result};
use funcd_pool::ContainerResponse;

use crate::pool::Runner;

#[async_trait]
pub trait Placer: Send + Sync + 'static {
    /// Attempt runners from the snapshot until one accepts, a
    /// non-retryable error surfaces, or the placement budget runs out.
    async fn place(
        &self,
        inv: &mut Invocation,
        runners: &[Arc<dyn Runner>],
    ) -> Result<ContainerResponse>;
}

/// Fail with `placement-deadline-exceeded` when the remaining budget
/// cannot fit another attempt.
pub(crate) fn check_deadline(inv: &Invocation) -> Result<()> {
    if inv.call.remaining_budget(Utc::now()).is_zero() {
        return Err(Error::PlacementDeadlineExceeded);
    }
    Ok(())
}

/// Run one attempt against a runner and classify the outcome.
pub(crate) enum Attempt {
    Placed(ContainerResponse),
    Rejected,
    Failed(Error),
}

pub(crate) async fn attempt(runner: &Arc<dyn Runner>, inv: &Invocation) -> Attempt {
    match runner.try_exec(&inv.call, inv.body.clone()).await {
        Ok(Some(resp)) => {
            metrics::placement_attempts().with_label_values(&["placed"]).inc();
            Attempt::Placed(resp)
        }
        Ok(None) => {
            metrics::placement_attempts().with_label_values(&["rejected"]).inc();
            tracing::debug!(runner = runner.address(), "runner rejected call");
            Attempt::Rejected
        }
        Err(e) if e.is_placement_retryable() => {
            metrics::placement_attempts().with_label_values(&["retryable"]).inc();
            tracing::debug!(runner = runner.address(), error = %e, "retryable placement failure");
            Attempt::Rejected
        }
        Err(e) => {
            metrics::placement_attempts().with_label_values(&["failed"]).inc();
            Attempt::Failed(e)
        }
    }
}
