//! TLS configuration and certificate generation for the bootstrap layer.

pub mod certs;
pub mod config;

pub use certs::{CertBundle, CertError, generate_dev_bundle};
pub use config::{TlsConfigError, TlsMode};
