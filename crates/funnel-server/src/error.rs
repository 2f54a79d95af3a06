//! Server error types.

use std::time::Duration;

use funnel_core::ServiceKind;

/// Errors surfaced to the caller of [`MuxServer::run`](crate::server::MuxServer::run).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {query}: {source}")]
    Bind {
        query: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server has been stopped")]
    Stopped,
}

/// Transport-level handshake failures for one connection.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Handshake with {peer} timed out after {timeout:?}")]
    Timeout { peer: String, timeout: Duration },

    #[error("Handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures turning a bootstrapped connection into a session.
#[derive(Debug, thiserror::Error)]
pub enum FiberizeError {
    #[error("Multiplexing setup failed: {0}")]
    Setup(String),

    #[error("Failed to open channel: {0}")]
    Channel(String),

    #[error("Session closed")]
    Closed,
}

/// Service manager and microservice failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to start service {service}: {reason}")]
    ServiceStart {
        service: ServiceKind,
        reason: String,
    },

    #[error("Service manager already stopped")]
    Stopped,
}
