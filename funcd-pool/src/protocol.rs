//! The framed stdio protocol spoken between the platform and a warm
//! container, selected by the function's `format`.
//!
//! - `default`: a 4-byte big-endian length prefix then the raw body, in
//!   each direction. The response status is implicitly 200.
//! - `json` / `cloudevent`: one JSON envelope per line in each direction;
//!   bodies are carried as text.
//! - `http`: HTTP/1.1 framing with a mandatory `Content-Length` in both
//!   directions (no chunked encoding).
//!
//! Every format leaves the streams positioned for the next exchange, so
//! a slot can serve sequential invocations without restarting.

use bytes::Bytes;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use funcd_core::models::Format;

use crate::driver::{ContainerRequest, ContainerResponse};

fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

/// Write one request frame.
pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    format: Format,
    req: &ContainerRequest,
) -> std::io::Result<()> {
    match format {
        Format::Default => {
            w.write_u32(req.body.len() as u32).await?;
            w.write_all(&req.body).await?;
        }
        Format::Json | Format::CloudEvent => {
            let headers: serde_json::Map<String, serde_json::Value> = req
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            let protocol = json!({
                "method": req.method,
                "request_url": req.url,
                "headers": headers,
            });
            let envelope = if format == Format::Json {
                json!({
                    "call_id": req.call_id,
                    "body": String::from_utf8_lossy(&req.body),
                    "protocol": protocol,
                })
            } else {
                json!({
                    "specversion": "1.0",
                    "id": req.call_id,
                    "source": "funcd",
                    "type": "io.funcd.invocation",
                    "data": String::from_utf8_lossy(&req.body),
                    "protocol": protocol,
                })
            };
            let mut line = serde_json::to_vec(&envelope)?;
            line.push(b'\n');
            w.write_all(&line).await?;
        }
        Format::Http => {
            let mut head = format!("{} {} HTTP/1.1\r\n", req.method, req.url);
            head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
            head.push_str(&format!("Fn-Call-Id: {}\r\n", req.call_id));
            for (k, v) in &req.headers {
                // Framing headers are platform-owned.
                if k.eq_ignore_ascii_case("content-length") || k.eq_ignore_ascii_case("transfer-encoding") {
                    continue;
                }
                head.push_str(&format!("{k}: {v}\r\n"));
            }
            head.push_str("\r\n");
            w.write_all(head.as_bytes()).await?;
            w.write_all(&req.body).await?;
        }
    }
    w.flush().await
}

/// Read one response frame.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
    format: Format,
) -> std::io::Result<ContainerResponse> {
    match format {
        Format::Default => {
            let len = r.read_u32().await?;
            let mut body = vec![0u8; len as usize];
            r.read_exact(&mut body).await?;
            Ok(ContainerResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from(body),
            })
        }
        Format::Json | Format::CloudEvent => {
            let mut line = String::new();
            if r.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "container closed stdout",
                ));
            }
            let envelope: serde_json::Value =
                serde_json::from_str(line.trim_end()).map_err(|e| invalid(format!("bad envelope: {e}")))?;
            let body = envelope
                .get("body")
                .or_else(|| envelope.get("data"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let status = envelope
                .get("status_code")
                .and_then(|v| v.as_u64())
                .unwrap_or(200) as u16;
            let headers = envelope
                .get("headers")
                .and_then(|v| v.as_object())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            Ok(ContainerResponse {
                status,
                headers,
                body: Bytes::from(body),
            })
        }
        Format::Http => {
            let mut status_line = String::new();
            if r.read_line(&mut status_line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "container closed stdout",
                ));
            }
            let status = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| invalid(format!("bad status line {status_line:?}")))?;

            let mut headers = Vec::new();
            let mut content_length: Option<usize> = None;
            loop {
                let mut line = String::new();
                r.read_line(&mut line).await?;
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                let (name, value) = line
                    .split_once(':')
                    .ok_or_else(|| invalid(format!("bad header line {line:?}")))?;
                let value = value.trim();
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(format!("bad content-length {value:?}")))?,
                    );
                } else {
                    headers.push((name.to_string(), value.to_string()));
                }
            }
            let len = content_length.ok_or_else(|| invalid("response missing content-length"))?;
            let mut body = vec![0u8; len];
            r.read_exact(&mut body).await?;
            Ok(ContainerResponse {
                status,
                headers,
                body: Bytes::from(body),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio::time::Instant;

    fn request(body: &'static [u8]) -> ContainerRequest {
        ContainerRequest {
            call_id: "call1".into(),
            method: "POST".into(),
            url: "/r/app/hello".into(),
            headers: vec![("accept".into(), "*/*".into())],
            body: Bytes::from_static(body),
            deadline: Instant::now() + std::time::Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn default_format_frames_with_length_prefix() {
        let mut wire = Vec::new();
        write_request(&mut wire, Format::Default, &request(b"ping"))
            .await
            .unwrap();
        assert_eq!(&wire[..4], &4u32.to_be_bytes());
        assert_eq!(&wire[4..], b"ping");

        let mut out = Vec::new();
        out.extend_from_slice(&4u32.to_be_bytes());
        out.extend_from_slice(b"pong");
        let resp = read_response(&mut BufReader::new(&out[..]), Format::Default)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn json_format_round_trips_envelopes() {
        let mut wire = Vec::new();
        write_request(&mut wire, Format::Json, &request(b"ping"))
            .await
            .unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(envelope["call_id"], "call1");
        assert_eq!(envelope["body"], "ping");
        assert_eq!(envelope["protocol"]["method"], "POST");

        let reply = b"{\"body\":\"pong\",\"status_code\":201,\"headers\":{\"x-fn\":\"1\"}}\n";
        let resp = read_response(&mut BufReader::new(&reply[..]), Format::Json)
            .await
            .unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, Bytes::from_static(b"pong"));
        assert_eq!(resp.headers, vec![("x-fn".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn cloudevent_response_reads_data_field() {
        let reply = b"{\"specversion\":\"1.0\",\"data\":\"pong\"}\n";
        let resp = read_response(&mut BufReader::new(&reply[..]), Format::CloudEvent)
            .await
            .unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"pong"));
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn http_format_parses_status_headers_and_body() {
        let mut wire = Vec::new();
        write_request(&mut wire, Format::Http, &request(b"ping"))
            .await
            .unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("POST /r/app/hello HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nping"));

        let reply = b"HTTP/1.1 502 Bad Gateway\r\nX-Fn: yes\r\nContent-Length: 5\r\n\r\nwhoop";
        let resp = read_response(&mut BufReader::new(&reply[..]), Format::Http)
            .await
            .unwrap();
        assert_eq!(resp.status, 502);
        assert_eq!(resp.headers, vec![("X-Fn".to_string(), "yes".to_string())]);
        assert_eq!(resp.body, Bytes::from_static(b"whoop"));
    }

    #[tokio::test]
    async fn http_response_without_content_length_is_rejected() {
        let reply = b"HTTP/1.1 200 OK\r\n\r\n";
        let err = read_response(&mut BufReader::new(&reply[..]), Format::Http)
            .await
            .expect_err("unframed response");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
