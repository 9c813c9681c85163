//! LB-side client for the pure-runner protocol.

use bytes::{Bytes, BytesMut};
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint};

use funcd_core::models::Call;
use funcd_core::{Error, Result};
use funcd_pool::ContainerResponse;

use crate::pb;
use crate::pb::client_msg::Body as ClientBody;
use crate::pb::runner_msg::Body as RunnerBody;
use crate::pb::runner_protocol_client::RunnerProtocolClient;
use crate::tls::TlsMaterial;

/// Maximum bytes per outbound data frame.
const FRAME_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct RunnerClient {
    address: String,
    client: RunnerProtocolClient<Channel>,
}

impl RunnerClient {
    /// Build a lazily-connecting client for one runner address. With TLS
    /// material the link is mutually authenticated.
    pub async fn connect(address: &str, tls: Option<&TlsMaterial>) -> Result<Self> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .map_err(|e| Error::Fatal(format!("runner address {address:?}: {e}")))?;
        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(tls.client_config().await?)
                .map_err(|e| Error::Fatal(format!("runner tls: {e}")))?;
        }
        let channel = endpoint.connect_lazy();
        Ok(Self {
            address: address.to_string(),
            client: RunnerProtocolClient::new(channel),
        })
    }

    /// Wrap an already-established channel (tests, custom transports).
    pub fn from_channel(address: &str, channel: Channel) -> Self {
        Self {
            address: address.to_string(),
            client: RunnerProtocolClient::new(channel),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Submit one call. `Ok(None)` means the runner rejected it with a
    /// retryable reason and the placer should try elsewhere.
    pub async fn try_exec(&self, call: &Call, body: Bytes) -> Result<Option<ContainerResponse>> {
        let call_json = serde_json::to_string(call).map_err(Error::upstream)?;
        let deadline_unix_ms = (call.created_at.timestamp_millis()) + (call.timeout as i64) * 1000;

        let mut frames = vec![pb::ClientMsg {
            body: Some(ClientBody::TryCall(pb::TryCall {
                call_json,
                slot_key: call.slot_key().to_string(),
                deadline_unix_ms,
            })),
        }];
        if body.is_empty() {
            frames.push(data_frame(Bytes::new(), true));
        } else {
            let chunks: Vec<Bytes> = body
                .chunks(FRAME_SIZE)
                .map(|c| Bytes::copy_from_slice(c))
                .collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                frames.push(data_frame(chunk, i == last));
            }
        }

        let mut client = self.client.clone();
        let mut inbound = client
            .engage(tokio_stream::iter(frames))
            .await
            .map_err(|s| Error::Upstream(format!("runner {}: {s}", self.address)))?
            .into_inner();

        // Acknowledged first.
        match next_body(&mut inbound, &self.address).await? {
            RunnerBody::Acknowledged(ack) if ack.committed => {}
            RunnerBody::Acknowledged(ack) => {
                let err = crate::error_from_code(&ack.details, &ack.details);
                if err.is_placement_retryable() {
                    return Ok(None);
                }
                return Err(err);
            }
            _ => {
                return Err(Error::Upstream(format!(
                    "runner {} broke protocol: expected acknowledgement",
                    self.address
                )))
            }
        }

        // Header, data frames, trailer.
        let mut status = 200u16;
        let mut headers = Vec::new();
        let mut resp_body = BytesMut::new();
        loop {
            match next_body(&mut inbound, &self.address).await? {
                RunnerBody::Header(h) => {
                    status = h.status_code as u16;
                    headers = h.headers.into_iter().collect();
                }
                RunnerBody::Data(frame) => {
                    resp_body.extend_from_slice(&frame.data);
                }
                RunnerBody::Finished(fin) => {
                    if fin.success {
                        return Ok(Some(ContainerResponse {
                            status,
                            headers,
                            body: resp_body.freeze(),
                        }));
                    }
                    return Err(crate::error_from_code(&fin.error_code, &fin.details));
                }
                RunnerBody::Acknowledged(_) => {
                    return Err(Error::Upstream(format!(
                        "runner {} broke protocol: duplicate acknowledgement",
                        self.address
                    )))
                }
            }
        }
    }
}

fn data_frame(data: Bytes, eof: bool) -> pb::ClientMsg {
    pb::ClientMsg {
        body: Some(ClientBody::Data(pb::DataFrame {
            data: data.to_vec(),
            eof,
        })),
    }
}

async fn next_body(
    inbound: &mut tonic::Streaming<pb::RunnerMsg>,
    address: &str,
) -> Result<RunnerBody> {
    match inbound.next().await {
        Some(Ok(pb::RunnerMsg { body: Some(body) })) => Ok(body),
        Some(Ok(pb::RunnerMsg { body: None })) => {
            Err(Error::Upstream(format!("runner {address} sent empty frame")))
        }
        Some(Err(s)) => Err(Error::Upstream(format!("runner {address}: {s}"))),
        None => Err(Error::Upstream(format!(
            "runner {address} closed the stream mid-call"
        ))),
    }
}
