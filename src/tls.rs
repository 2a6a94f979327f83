//! TLS material loading for mutual TLS.
//!
//! Both binaries present an identity and verify the peer against the same
//! CA. The server additionally requires a client certificate, which is where
//! request identities come from (see `rbac`).

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate not found: {0}")]
    CaNotFound(PathBuf),

    #[error("certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tonic: this side's identity plus
/// the CA used to verify the peer.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca: Certificate,
}

impl TlsIdentity {
    /// Loads certificate, key and CA from disk. Paths are validated first so
    /// the error names the missing file instead of a bare ENOENT.
    pub async fn load(ca: &Path, cert: &Path, key: &Path) -> Result<Self, TlsError> {
        if !ca.exists() {
            return Err(TlsError::CaNotFound(ca.to_path_buf()));
        }
        if !cert.exists() {
            return Err(TlsError::CertNotFound(cert.to_path_buf()));
        }
        if !key.exists() {
            return Err(TlsError::KeyNotFound(key.to_path_buf()));
        }

        let ca_pem = fs::read(ca).await?;
        let cert_pem = fs::read(cert).await?;
        let key_pem = fs::read(key).await?;

        Ok(TlsIdentity {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca: Certificate::from_pem(ca_pem),
        })
    }

    /// Server-side config: present our identity and require a client
    /// certificate signed by the CA.
    pub fn server(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca.clone())
    }

    /// Client-side config: present our identity and verify the server
    /// against the CA.
    pub fn client(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(self.ca.clone())
            .identity(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_reports_the_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = tmp.path().join("ca.crt");
        let cert = tmp.path().join("client.crt");
        let key = tmp.path().join("client.key");

        let result = TlsIdentity::load(&ca, &cert, &key).await;
        assert!(matches!(result, Err(TlsError::CaNotFound(_))));

        std::fs::write(&ca, "pem").unwrap();
        let result = TlsIdentity::load(&ca, &cert, &key).await;
        assert!(matches!(result, Err(TlsError::CertNotFound(_))));

        std::fs::write(&cert, "pem").unwrap();
        let result = TlsIdentity::load(&ca, &cert, &key).await;
        assert!(matches!(result, Err(TlsError::KeyNotFound(_))));
    }
}
