//! Docker driver: shells out to the docker CLI. One `docker run -i` per
//! slot; invocations are framed over the container's stdio, stderr is
//! collected as the function log, and termination goes through
//! `docker stop` so the container sees SIGTERM before the kill.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use funcd_core::models::Format;
use funcd_core::{Error, Result, SlotKey};

use crate::driver::{ContainerDriver, ContainerHandle, ContainerRequest, ContainerResponse, ContainerSpec};
use crate::protocol;

#[derive(Debug, Clone)]
pub struct DockerDriver {
    bin: String,
}

impl DockerDriver {
    pub fn new() -> Self {
        Self {
            bin: "docker".into(),
        }
    }

    /// Point at a different docker-compatible CLI (podman, nerdctl).
    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for DockerDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn container_name(key: &SlotKey) -> String {
    let prefix: String = key.as_str().chars().take(12).collect();
    format!("funcd-{prefix}-{:08x}", rand::random::<u32>())
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn launch(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerHandle>> {
        let name = container_name(&spec.slot_key);
        let mut cmd = Command::new(&self.bin);
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&name)
            .arg("--memory")
            .arg(format!("{}m", spec.memory_mb));
        if spec.cpus_milli > 0 {
            cmd.arg("--cpus")
                .arg(format!("{:.3}", spec.cpus_milli as f64 / 1000.0));
        }
        for (k, v) in &spec.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(&spec.image)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ContainerError(format!("spawning {}: {e}", spec.image)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ContainerError("container stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ContainerError("container stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ContainerError("container stderr unavailable".into()))?;

        // Function logs stream in on stderr for the slot's whole life.
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let collector_buf = stderr_buf.clone();
        tokio::spawn(async move {
            let mut stderr = stderr;
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => collector_buf.lock().unwrap().extend_from_slice(&chunk[..n]),
                }
            }
        });

        tracing::debug!(container = %name, image = %spec.image, "container launched");
        Ok(Box::new(DockerContainer {
            bin: self.bin.clone(),
            name,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_buf,
            format: spec.format,
            healthy: true,
        }))
    }
}

struct DockerContainer {
    bin: String,
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    format: Format,
    healthy: bool,
}

impl DockerContainer {
    fn stderr_tail(&self) -> String {
        let buf = self.stderr_buf.lock().unwrap();
        let tail = &buf[buf.len().saturating_sub(256)..];
        String::from_utf8_lossy(tail).into_owned()
    }
}

#[async_trait]
impl ContainerHandle for DockerContainer {
    async fn invoke(&mut self, req: ContainerRequest) -> Result<ContainerResponse> {
        let deadline = req.deadline;
        let format = self.format;
        // Pessimistic health: an invoke future dropped mid-exchange
        // leaves the streams desynced, so the flag only recovers on a
        // completed exchange.
        self.healthy = false;
        let exchange = async {
            protocol::write_request(&mut self.stdin, format, &req).await?;
            protocol::read_response(&mut self.stdout, format).await
        };
        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(resp)) => {
                self.healthy = true;
                Ok(resp)
            }
            Ok(Err(io)) => {
                if io.kind() == std::io::ErrorKind::UnexpectedEof {
                    // The process died mid-exchange; report its exit.
                    let exit_code = self
                        .child
                        .try_wait()
                        .ok()
                        .flatten()
                        .and_then(|s| s.code())
                        .unwrap_or(-1);
                    Err(Error::FunctionError {
                        exit_code,
                        details: self.stderr_tail(),
                    })
                } else {
                    Err(Error::ContainerError(io.to_string()))
                }
            }
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    fn take_logs(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.stderr_buf.lock().unwrap()))
    }

    fn healthy(&self) -> bool {
        self.healthy
    }

    async fn terminate(mut self: Box<Self>, grace: Duration) {
        let stop = Command::new(&self.bin)
            .arg("stop")
            .arg("-t")
            .arg(grace.as_secs().max(1).to_string())
            .arg(&self.name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = stop {
            tracing::warn!(container = %self.name, error = %e, "docker stop failed");
        }
        match tokio::time::timeout(grace + Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
        tracing::debug!(container = %self.name, "container terminated");
    }
}
