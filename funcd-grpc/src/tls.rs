//! Mutual-TLS material for the runner ↔ LB link, loaded from the
//! `node-cert`, `node-cert-key` and `node-cert-authority` options.

use std::path::{Path, PathBuf};

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use funcd_core::{Error, Result};

/// Paths to the node's certificate, key and trust anchor.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub authority: PathBuf,
}

impl TlsMaterial {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>, authority: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            authority: authority.into(),
        }
    }

    async fn load(&self) -> Result<(Identity, Certificate)> {
        let cert = read(&self.cert).await?;
        let key = read(&self.key).await?;
        let ca = read(&self.authority).await?;
        Ok((Identity::from_pem(cert, key), Certificate::from_pem(ca)))
    }

    /// TLS config for the pure-runner listener; requires client certs
    /// signed by the shared authority.
    pub async fn server_config(&self) -> Result<ServerTlsConfig> {
        let (identity, ca) = self.load().await?;
        Ok(ServerTlsConfig::new().identity(identity).client_ca_root(ca))
    }

    /// TLS config for the LB-side client.
    pub async fn client_config(&self) -> Result<ClientTlsConfig> {
        let (identity, ca) = self.load().await?;
        Ok(ClientTlsConfig::new().identity(identity).ca_certificate(ca))
    }
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::Fatal(format!("reading {}: {e}", path.display())))
}
