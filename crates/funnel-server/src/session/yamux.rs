//! Session implementation backed by `tokio-yamux`.

use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_yamux::Control;
use tokio_yamux::config::Config;
use tokio_yamux::session::Session as MuxSession;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, info, warn};

use super::{ConnectionId, Fiberizer, Session};
use crate::error::FiberizeError;
use crate::transport::{BoxedStream, RawConnection};

/// Default number of inbound channels queued before new ones are refused.
const DEFAULT_INBOUND_BACKLOG: usize = 64;

/// Creates server-mode yamux sessions.
#[derive(Clone)]
pub struct YamuxFiberizer {
    config: Config,
    inbound_backlog: usize,
}

impl YamuxFiberizer {
    pub const fn new(config: Config, inbound_backlog: usize) -> Self {
        Self {
            config,
            inbound_backlog,
        }
    }
}

impl Default for YamuxFiberizer {
    fn default() -> Self {
        Self::new(Config::default(), DEFAULT_INBOUND_BACKLOG)
    }
}

#[async_trait]
impl Fiberizer for YamuxFiberizer {
    async fn fiberize(
        &self,
        conn: RawConnection,
        id: ConnectionId,
    ) -> Result<Arc<dyn Session>, FiberizeError> {
        if self.inbound_backlog == 0 {
            return Err(FiberizeError::Setup("inbound backlog must be non-zero".into()));
        }

        let RawConnection { stream, peer } = conn;
        let session = MuxSession::new_server(stream, self.config.clone());
        let control = session.control();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_backlog);
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        // Detached; its end is observable through `closed()`.
        tokio::spawn(drive(
            session,
            inbound_tx,
            shutdown.clone(),
            closed.clone(),
            id,
            peer.clone(),
        ));

        info!(connection = %id, peer = %peer, "Session fiberized");
        Ok(Arc::new(YamuxSession {
            id,
            control: std::sync::Mutex::new(control),
            inbound: Mutex::new(inbound_rx),
            shutdown,
            closed,
        }))
    }
}

/// Polls the yamux session until the peer leaves, an error occurs or
/// `shutdown` fires.
///
/// `closed` fires only after the session, and with it the transport, has
/// been dropped, so whoever awaits `Session::closed` also waits for this
/// task's teardown.
async fn drive(
    mut session: MuxSession<BoxedStream>,
    inbound: mpsc::Sender<StreamHandle>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    id: ConnectionId,
    peer: String,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(connection = %id, "Session close requested");
                break;
            }
            item = session.next() => match item {
                Some(Ok(stream)) => {
                    if inbound.try_send(stream).is_err() {
                        warn!(connection = %id, "Inbound channel refused: backlog full or no acceptor");
                    }
                }
                Some(Err(e)) => {
                    warn!(connection = %id, peer = %peer, error = %e, "Session error");
                    break;
                }
                None => {
                    debug!(connection = %id, peer = %peer, "Peer closed session");
                    break;
                }
            }
        }
    }
    drop(inbound);
    drop(session);
    closed.cancel();
}

/// Handle to a yamux session whose I/O runs on a background task.
pub struct YamuxSession {
    id: ConnectionId,
    control: std::sync::Mutex<Control>,
    inbound: Mutex<mpsc::Receiver<StreamHandle>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

#[async_trait]
impl Session for YamuxSession {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn open_channel(&self) -> Result<BoxedStream, FiberizeError> {
        if self.is_closed() {
            return Err(FiberizeError::Closed);
        }
        let mut control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let stream = control
            .open_stream()
            .await
            .map_err(|e| FiberizeError::Channel(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn accept_channel(&self) -> Option<BoxedStream> {
        let mut inbound = self.inbound.lock().await;
        inbound
            .recv()
            .await
            .map(|stream| Box::new(stream) as BoxedStream)
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
