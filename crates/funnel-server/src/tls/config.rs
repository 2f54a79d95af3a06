//! TLS configuration for the bootstrap layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use super::certs::{CertError, generate_dev_bundle, write_dev_certs};

/// TLS configuration for the server.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// No TLS (plaintext). Development only.
    Disabled,
    /// Auto-generated self-signed certificate for development.
    DevSelfSigned {
        /// Directory to store generated certs.
        cert_dir: PathBuf,
    },
    /// User-provided certificate and key files.
    Custom {
        /// Path to PEM-encoded certificate file.
        cert_path: PathBuf,
        /// Path to PEM-encoded private key file.
        key_path: PathBuf,
    },
}

impl TlsMode {
    /// Build a rustls `ServerConfig` from this mode.
    ///
    /// Returns `None` if TLS is disabled.
    pub fn to_server_config(&self) -> Result<Option<Arc<ServerConfig>>, TlsConfigError> {
        match self {
            Self::Disabled => Ok(None),
            Self::DevSelfSigned { cert_dir } => {
                info!("Generating dev TLS certificates");
                let bundle = generate_dev_bundle(&["localhost", "127.0.0.1", "0.0.0.0"])?;
                write_dev_certs(cert_dir, &bundle)?;

                let config =
                    server_config_from_pem(&bundle.server_cert_pem, &bundle.server_key_pem)?;
                info!(cert_dir = %cert_dir.display(), "Dev TLS enabled");
                Ok(Some(config))
            }
            Self::Custom {
                cert_path,
                key_path,
            } => {
                let cert_pem = read_pem(cert_path, "cert")?;
                let key_pem = read_pem(key_path, "key")?;

                let config = server_config_from_pem(&cert_pem, &key_pem)?;
                info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Custom TLS enabled"
                );
                Ok(Some(config))
            }
        }
    }
}

fn read_pem(path: &Path, what: &str) -> Result<String, TlsConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        TlsConfigError::FileRead(format!("Failed to read {what} {}: {e}", path.display()))
    })
}

/// Build a server config from PEM-encoded certificate chain and private key.
pub fn server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| TlsConfigError::Pem(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(TlsConfigError::Pem("No certificates found".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| TlsConfigError::Pem(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| TlsConfigError::Pem("No private key found".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("File read error: {0}")]
    FileRead(String),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("TLS configuration error: {0}")]
    Rustls(String),
}

impl From<CertError> for TlsConfigError {
    fn from(e: CertError) -> Self {
        Self::CertGeneration(e.to_string())
    }
}
