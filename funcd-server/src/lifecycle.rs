//! The shutdown tree: one token fans in OS signals and every registered
//! subsystem failure; cancelling it starts the graceful teardown.

use tokio_util::sync::CancellationToken;

/// Shared shutdown token plus registration for subsystems whose failure
/// should also stop the node.
#[derive(Clone)]
pub struct Lifecycle {
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        let shutdown = CancellationToken::new();
        spawn_signal_listener(shutdown.clone());
        Self { shutdown }
    }

    /// The fan-in token; cancelled on the first of signal or registered
    /// subsystem failure.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a subsystem-owned token: when it cancels, the node
    /// shuts down.
    pub fn register(&self, subsystem: CancellationToken, name: &'static str) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            subsystem.cancelled().await;
            if !shutdown.is_cancelled() {
                tracing::error!(subsystem = name, "subsystem failed, shutting down node");
                shutdown.cancel();
            }
        });
    }

    pub async fn wait(&self) {
        self.shutdown.cancelled().await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel the shutdown token on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        tracing::info!("shutdown signal received, starting graceful shutdown");
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn registered_subsystem_failure_cancels_the_node() {
        let lifecycle = Lifecycle::new();
        let subsystem = CancellationToken::new();
        lifecycle.register(subsystem.clone(), "test-subsystem");

        subsystem.cancel();
        tokio::time::timeout(Duration::from_secs(1), lifecycle.wait())
            .await
            .expect("fan-in fires");
    }
}
