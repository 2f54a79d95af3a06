//! TCP transport backed by `tokio::net::TcpListener`.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::{Acceptor, RawConnection, TransportBinder};

/// Binds TCP listeners for `host:port` queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl TransportBinder for TcpTransport {
    async fn bind(&self, query: &str) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(query).await?;
        let acceptor = TcpAcceptor::new(listener)?;
        info!(query, addr = %acceptor.local_addr(), "TCP acceptor listening");
        Ok(Box::new(acceptor))
    }
}

/// Acceptor over a bound TCP listener.
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: String,
}

impl TcpAcceptor {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?.to_string();
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<RawConnection> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(RawConnection::new(stream, peer.to_string()))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}
