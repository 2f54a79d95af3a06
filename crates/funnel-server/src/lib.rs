//! Funnel Server Library
//!
//! Core functionality for the funnel tunnel endpoint:
//! - Transport binding and per-connection bootstrap (plain or TLS)
//! - Yamux sessions multiplexing each connection into virtual circuits
//! - Per-session service managers driven by the service configuration
//! - Connection registry and the multiplexing server tying them together

pub mod error;
pub mod registry;
pub mod server;
pub mod service;
pub mod session;
pub mod tls;
pub mod transport;

pub use error::{BootstrapError, FiberizeError, ServerError, ServiceError};
pub use server::{MuxServer, MuxServerBuilder, ServerConfig};
