//! The async worker loop on full nodes: pulls queued calls, re-runs them
//! through the agent's submit path, and deletes them from the queue on
//! completion. Delivery is at-least-once; a redelivered call whose
//! record already completed cannot overwrite the earlier attempt.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use funcd_core::Error;
use funcd_data::DataAccess;

use crate::agent::{Agent, Invocation};

/// Poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Backoff after a retryable execution failure or queue error.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Spawn one dequeue worker; cancel the token to stop it.
pub fn spawn_async_worker(
    agent: Arc<dyn Agent>,
    da: Arc<dyn DataAccess>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("async worker started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = da.dequeue() => next,
            };
            match next {
                Ok(Some(call)) => {
                    let body = call
                        .payload
                        .as_deref()
                        .and_then(|p| base64::engine::general_purpose::STANDARD.decode(p).ok())
                        .map(Bytes::from)
                        .unwrap_or_default();
                    let call_id = call.id.clone();
                    let mut inv = Invocation::new(call, body);
                    inv.cancel = cancel.child_token();

                    match agent.submit(&mut inv).await {
                        Ok(_) => {
                            if let Err(e) = da.delete_from_queue(&call_id).await {
                                tracing::warn!(call_id = %call_id, error = %e, "failed to delete completed call from queue");
                            }
                        }
                        // Capacity pressure: leave the message reserved so
                        // the lease redelivers it, and back off.
                        Err(Error::ResourceUnavailable) | Err(Error::SlotTimeout) => {
                            tracing::info!(call_id = %call_id, "async call deferred, node busy");
                            tokio::time::sleep(RETRY_BACKOFF).await;
                        }
                        // Anything else completed the record with a
                        // terminal failure; the queue entry is done.
                        Err(e) => {
                            tracing::warn!(call_id = %call_id, error = %e, "async call failed");
                            if let Err(del) = da.delete_from_queue(&call_id).await {
                                tracing::warn!(call_id = %call_id, error = %del, "failed to delete failed call from queue");
                            }
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "queue dequeue failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LocalAgent;
    use funcd_core::models::{App, Call, CallStatus};
    use funcd_data::{Datastore, DirectAccess, MemDatastore, MemLogStore, MemQueue};
    use funcd_pool::mock::MockDriver;
    use funcd_pool::{SlotPool, SlotPoolConfig};

    #[tokio::test]
    async fn enqueued_call_is_executed_and_completed() {
        let datastore = Arc::new(MemDatastore::new());
        datastore.insert_app(App::new("myapp")).await.unwrap();
        let da: Arc<dyn DataAccess> = Arc::new(DirectAccess::new(
            datastore.clone(),
            Arc::new(MemLogStore::new()),
            Arc::new(MemQueue::new()),
        ));
        let pool = SlotPool::new(Arc::new(MockDriver::new()), SlotPoolConfig::default());
        let agent: Arc<dyn Agent> = Arc::new(LocalAgent::new(da.clone(), pool, None));

        let mut call = Call::new("app1", "myapp");
        call.route = Some("/hello".into());
        call.image = "img".into();
        call.timeout = 5;
        let call_id = call.id.clone();
        let mut inv = Invocation::new(call, Bytes::from_static(b"work"));
        agent.enqueue(&mut inv).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = spawn_async_worker(agent, da.clone(), cancel.clone());

        // Wait for the record to reach a terminal state.
        let mut status = CallStatus::Queued;
        for _ in 0..50 {
            status = datastore.get_call("app1", &call_id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, CallStatus::Success);

        // The queue entry is gone: nothing left to dequeue.
        assert!(da.dequeue().await.unwrap().is_none());

        cancel.cancel();
        worker.await.unwrap();
    }
}
