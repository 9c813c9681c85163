//! The pure-runner service: accepts invocation streams from LB nodes and
//! drives them through the local agent. Holds no catalog; trusts the
//! header frame and enforces only its own capacity and deadline.

use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use funcd_agent::{Agent, Invocation, LocalAgent};
use funcd_core::models::Call;

use crate::pb;
use crate::pb::client_msg::Body as ClientBody;
use crate::pb::runner_msg::Body as RunnerBody;
use crate::pb::runner_protocol_server::RunnerProtocol;

pub struct PureRunner {
    agent: Arc<LocalAgent>,
}

impl PureRunner {
    pub fn new(agent: Arc<LocalAgent>) -> Self {
        Self { agent }
    }

    pub fn into_server(self) -> pb::runner_protocol_server::RunnerProtocolServer<Self> {
        pb::runner_protocol_server::RunnerProtocolServer::new(self)
    }
}

fn msg(body: RunnerBody) -> pb::RunnerMsg {
    pb::RunnerMsg { body: Some(body) }
}

#[tonic::async_trait]
impl RunnerProtocol for PureRunner {
    type EngageStream = Pin<Box<dyn Stream<Item = Result<pb::RunnerMsg, Status>> + Send>>;

    async fn engage(
        &self,
        request: Request<Streaming<pb::ClientMsg>>,
    ) -> Result<Response<Self::EngageStream>, Status> {
        let mut inbound = request.into_inner();
        let agent = self.agent.clone();
        let (tx, rx) = mpsc::channel::<Result<pb::RunnerMsg, Status>>(8);

        tokio::spawn(async move {
            if let Err(status) = engage_one(agent, &mut inbound, &tx).await {
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

async fn engage_one(
    agent: Arc<LocalAgent>,
    inbound: &mut Streaming<pb::ClientMsg>,
    tx: &mpsc::Sender<Result<pb::RunnerMsg, Status>>,
) -> Result<(), Status> {
    // Header frame first.
    let try_call = match inbound.next().await {
        Some(Ok(pb::ClientMsg {
            body: Some(ClientBody::TryCall(tc)),
        })) => tc,
        Some(Ok(_)) => return Err(Status::invalid_argument("expected TryCall first")),
        Some(Err(e)) => return Err(e),
        None => return Err(Status::invalid_argument("empty engagement")),
    };
    let call: Call = serde_json::from_str(&try_call.call_json)
        .map_err(|e| Status::invalid_argument(format!("bad call document: {e}")))?;

    // Capacity gate before any allocation: a rejected call must not
    // touch the pool.
    if !agent.can_admit(call.memory) {
        tracing::debug!(call_id = %call.id, "rejecting call, at capacity");
        let _ = tx
            .send(Ok(msg(RunnerBody::Acknowledged(pb::Acknowledged {
                committed: false,
                details: "resource-unavailable".into(),
            }))))
            .await;
        return Ok(());
    }
    tx.send(Ok(msg(RunnerBody::Acknowledged(pb::Acknowledged {
        committed: true,
        details: String::new(),
    }))))
    .await
    .map_err(|_| Status::cancelled("client went away"))?;

    // Body frames until eof. Backpressure rides on gRPC flow control.
    let mut body = BytesMut::new();
    loop {
        match inbound.next().await {
            Some(Ok(pb::ClientMsg {
                body: Some(ClientBody::Data(frame)),
            })) => {
                body.extend_from_slice(&frame.data);
                if frame.eof {
                    break;
                }
            }
            Some(Ok(_)) => return Err(Status::invalid_argument("unexpected second TryCall")),
            Some(Err(e)) => return Err(e),
            None => return Err(Status::invalid_argument("stream ended before eof")),
        }
    }

    let mut inv = Invocation::new(call, body.freeze());

    // gRPC context cancellation propagates into the invocation token:
    // the response channel closes when the caller hangs up.
    let cancel = inv.cancel.clone();
    let watcher_tx = tx.clone();
    let watcher = tokio::spawn(async move {
        watcher_tx.closed().await;
        cancel.cancel();
    });

    let outcome = agent.submit(&mut inv).await;
    watcher.abort();

    match outcome {
        Ok(resp) => {
            let headers = resp
                .headers
                .iter()
                .cloned()
                .collect::<std::collections::HashMap<_, _>>();
            let _ = tx
                .send(Ok(msg(RunnerBody::Header(pb::ResponseHeader {
                    status_code: resp.status as i32,
                    headers,
                }))))
                .await;
            let _ = tx
                .send(Ok(msg(RunnerBody::Data(pb::DataFrame {
                    data: resp.body.to_vec(),
                    eof: true,
                }))))
                .await;
            let usage = inv.call.usage.unwrap_or_default();
            let _ = tx
                .send(Ok(msg(RunnerBody::Finished(pb::Finished {
                    success: true,
                    details: String::new(),
                    status: inv.call.status.as_str().into(),
                    duration_ms: usage.duration_ms as i64,
                    memory_mb: usage.memory_mb as i64,
                    error_code: String::new(),
                }))))
                .await;
        }
        Err(e) => {
            let _ = tx
                .send(Ok(msg(RunnerBody::Finished(pb::Finished {
                    success: false,
                    details: e.to_string(),
                    status: inv.call.status.as_str().into(),
                    duration_ms: 0,
                    memory_mb: 0,
                    error_code: e.code().into(),
                }))))
                .await;
        }
    }
    Ok(())
}
