//! Development certificate generation using rcgen.
//!
//! Generates a self-signed server certificate for local development and
//! testing. NOT suitable for production use.

use std::path::Path;

use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair};
use tracing::info;

/// Generated certificate bundle (PEM-encoded).
pub struct CertBundle {
    /// Server certificate PEM.
    pub server_cert_pem: String,
    /// Server private key PEM.
    pub server_key_pem: String,
}

/// Generate a self-signed server certificate for the given names.
pub fn generate_dev_bundle(server_names: &[&str]) -> Result<CertBundle, CertError> {
    let mut params = CertificateParams::new(
        server_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| CertError::Generation(e.to_string()))?;

    params
        .distinguished_name
        .push(DnType::CommonName, "funnel dev server");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let server_key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let server_cert = params
        .self_signed(&server_key)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CertBundle {
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
    })
}

/// Write a dev certificate bundle to disk as `server.pem` / `server-key.pem`.
pub fn write_dev_certs(dir: &Path, bundle: &CertBundle) -> Result<(), CertError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CertError::Io(format!("Failed to create cert dir: {e}")))?;

    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server-key.pem");

    std::fs::write(&cert_path, &bundle.server_cert_pem)
        .map_err(|e| CertError::Io(format!("Failed to write server cert: {e}")))?;
    std::fs::write(&key_path, &bundle.server_key_pem)
        .map_err(|e| CertError::Io(format!("Failed to write server key: {e}")))?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "Dev certificates written"
    );

    Ok(())
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(String),
}
