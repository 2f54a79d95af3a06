//! Virtual-circuit sessions.
//!
//! A [`Session`] multiplexes one bootstrapped connection into many logical
//! channels. The server only needs its identity, `close()` and the
//! `closed()` notification; channels are for the services.

mod yamux;

pub use yamux::{YamuxFiberizer, YamuxSession};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::FiberizeError;
use crate::transport::{BoxedStream, RawConnection};

/// Process-unique identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One multiplexed connection hosting many virtual circuits.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Open an outbound virtual circuit to the peer.
    async fn open_channel(&self) -> Result<BoxedStream, FiberizeError>;

    /// Next inbound virtual circuit, `None` once the session is closed.
    async fn accept_channel(&self) -> Option<BoxedStream>;

    /// Ask the session to close. Idempotent, never blocks.
    fn close(&self);

    /// Resolves once the session has closed, whatever the cause.
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}

/// Turns a bootstrapped connection into a [`Session`].
#[async_trait]
pub trait Fiberizer: Send + Sync {
    async fn fiberize(
        &self,
        conn: RawConnection,
        id: ConnectionId,
    ) -> Result<Arc<dyn Session>, FiberizeError>;
}
