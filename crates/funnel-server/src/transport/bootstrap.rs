//! Bootstrap policies: plain pass-through and TLS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{BootstrapPolicy, RawConnection};
use crate::error::BootstrapError;

/// Hands the accepted connection to the multiplexer unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainBootstrap;

#[async_trait]
impl BootstrapPolicy for PlainBootstrap {
    async fn upgrade(&self, conn: RawConnection) -> Result<RawConnection, BootstrapError> {
        debug!(peer = %conn.peer, "Plain bootstrap");
        Ok(conn)
    }
}

/// Performs a server-side TLS handshake, bounded by a timeout.
#[derive(Clone)]
pub struct TlsBootstrap {
    acceptor: TlsAcceptor,
    timeout: Duration,
}

impl TlsBootstrap {
    pub fn new(config: Arc<ServerConfig>, timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            timeout,
        }
    }
}

#[async_trait]
impl BootstrapPolicy for TlsBootstrap {
    async fn upgrade(&self, conn: RawConnection) -> Result<RawConnection, BootstrapError> {
        let RawConnection { stream, peer } = conn;
        match tokio::time::timeout(self.timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => {
                debug!(peer = %peer, "TLS handshake complete");
                Ok(RawConnection::new(tls, peer))
            }
            Ok(Err(source)) => Err(BootstrapError::Handshake { peer, source }),
            Err(_) => Err(BootstrapError::Timeout {
                peer,
                timeout: self.timeout,
            }),
        }
    }
}
