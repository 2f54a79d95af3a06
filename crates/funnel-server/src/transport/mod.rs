//! Transport capabilities consumed by the server.
//!
//! The server never touches sockets directly: it binds through a
//! [`TransportBinder`], accepts from the resulting [`Acceptor`], and upgrades
//! each accepted connection with a [`BootstrapPolicy`].

mod bootstrap;
mod tcp;

pub use bootstrap::{PlainBootstrap, TlsBootstrap};
pub use tcp::{TcpAcceptor, TcpTransport};

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::BootstrapError;

/// Byte stream usable as a transport connection or a virtual circuit.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport stream.
pub type BoxedStream = Box<dyn Transport>;

/// A connection accepted from the transport, before or after bootstrap.
pub struct RawConnection {
    /// Underlying byte stream.
    pub stream: BoxedStream,
    /// Peer description used in logs.
    pub peer: String,
}

impl RawConnection {
    pub fn new(stream: impl Transport, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Bound listener producing raw connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<RawConnection>;

    /// Address the acceptor listens on, for logs.
    fn local_addr(&self) -> String;
}

/// Resolves a target query and binds an [`Acceptor`] to it.
#[async_trait]
pub trait TransportBinder: Send + Sync {
    async fn bind(&self, query: &str) -> io::Result<Box<dyn Acceptor>>;
}

/// Transport-level handshake applied to every accepted connection.
#[async_trait]
pub trait BootstrapPolicy: Send + Sync {
    async fn upgrade(&self, conn: RawConnection) -> Result<RawConnection, BootstrapError>;
}
