//! Accept loop and per-connection pipeline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use funnel_core::ServiceConfig;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::ServerConfig;
use crate::error::ServerError;
use crate::registry::{ConnectionRegistry, RegistryEntry};
use crate::service::{LocalServiceManagerFactory, ServiceManagerFactory};
use crate::session::{ConnectionId, Fiberizer, YamuxFiberizer};
use crate::transport::{
    Acceptor, BootstrapPolicy, PlainBootstrap, RawConnection, TcpTransport, TransportBinder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Binding,
    Running,
    Stopped,
}

struct Shared {
    services: ServiceConfig,
    config: ServerConfig,
    binder: Arc<dyn TransportBinder>,
    bootstrap: Arc<dyn BootstrapPolicy>,
    fiberizer: Arc<dyn Fiberizer>,
    managers: Arc<dyn ServiceManagerFactory>,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    handle: Handle,
    state: Mutex<RunState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        {
            let mut state = self.state();
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Stopped;
        }

        info!("Stopping server");
        self.shutdown.cancel();

        // Taken under the registry lock, signalled after it is released.
        let drained = self.registry.drain();
        let count = drained.len();
        for (id, entry) in drained {
            debug!(connection = %id, "Tearing down connection");
            entry.shutdown();
        }
        self.tasks.close();

        info!(connections = count, "Server stopped");
    }
}

/// Builder for [`MuxServer`].
///
/// Every capability defaults to the production implementation: TCP
/// transport, no handshake, yamux sessions and a service manager with an
/// empty catalog.
pub struct MuxServerBuilder {
    services: ServiceConfig,
    config: ServerConfig,
    binder: Arc<dyn TransportBinder>,
    bootstrap: Arc<dyn BootstrapPolicy>,
    fiberizer: Arc<dyn Fiberizer>,
    managers: Arc<dyn ServiceManagerFactory>,
}

impl MuxServerBuilder {
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn transport(mut self, binder: Arc<dyn TransportBinder>) -> Self {
        self.binder = binder;
        self
    }

    #[must_use]
    pub fn bootstrap(mut self, bootstrap: Arc<dyn BootstrapPolicy>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    #[must_use]
    pub fn fiberizer(mut self, fiberizer: Arc<dyn Fiberizer>) -> Self {
        self.fiberizer = fiberizer;
        self
    }

    #[must_use]
    pub fn service_managers(mut self, managers: Arc<dyn ServiceManagerFactory>) -> Self {
        self.managers = managers;
        self
    }

    /// Build the server. All of its work runs on `handle`.
    pub fn build(self, handle: Handle) -> MuxServer {
        MuxServer {
            shared: Arc::new(Shared {
                services: self.services,
                config: self.config,
                binder: self.binder,
                bootstrap: self.bootstrap,
                fiberizer: self.fiberizer,
                managers: self.managers,
                registry: ConnectionRegistry::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                handle,
                state: Mutex::new(RunState::Idle),
            }),
        }
    }
}

/// Connection multiplexing server.
///
/// Each accepted connection is bootstrapped, fiberized into a session and
/// paired with a service manager built from the configuration snapshot
/// taken at construction. The pair stays registered until the session
/// closes or the server stops.
pub struct MuxServer {
    shared: Arc<Shared>,
}

impl MuxServer {
    pub fn builder(services: ServiceConfig) -> MuxServerBuilder {
        MuxServerBuilder {
            services,
            config: ServerConfig::default(),
            binder: Arc::new(TcpTransport),
            bootstrap: Arc::new(PlainBootstrap),
            fiberizer: Arc::new(YamuxFiberizer::default()),
            managers: Arc::new(LocalServiceManagerFactory::default()),
        }
    }

    /// Bind `query` and start accepting connections.
    ///
    /// Returns the bound address once listening; the accept loop keeps
    /// running on the server's runtime. A bind failure leaves the server
    /// able to `run` again.
    pub async fn run(&self, query: &str) -> Result<String, ServerError> {
        {
            let mut state = self.shared.state();
            match *state {
                RunState::Idle => *state = RunState::Binding,
                RunState::Binding | RunState::Running => return Err(ServerError::AlreadyRunning),
                RunState::Stopped => return Err(ServerError::Stopped),
            }
        }

        let acceptor = match self.shared.binder.bind(query).await {
            Ok(acceptor) => acceptor,
            Err(source) => {
                let mut state = self.shared.state();
                if *state == RunState::Binding {
                    *state = RunState::Idle;
                }
                return Err(ServerError::Bind {
                    query: query.to_string(),
                    source,
                });
            }
        };

        let local_addr = acceptor.local_addr();
        {
            let mut state = self.shared.state();
            if *state == RunState::Stopped {
                return Err(ServerError::Stopped);
            }
            *state = RunState::Running;
        }

        info!(addr = %local_addr, relay_only = self.shared.config.relay_only, "Server listening");
        self.shared
            .tasks
            .spawn_on(accept_loop(Arc::clone(&self.shared), acceptor), &self.shared.handle);
        Ok(local_addr)
    }

    /// Stop accepting, abandon pending handshakes and tear down every live
    /// connection. Idempotent and callable from any thread.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Wait for the accept loop, every connection task and the sessions
    /// they own to finish.
    pub async fn join(&self) {
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
    }

    /// Runtime the server's tasks are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    pub fn is_running(&self) -> bool {
        *self.shared.state() == RunState::Running
    }

    /// Configuration snapshot handed to every service manager.
    pub fn services(&self) -> &ServiceConfig {
        &self.shared.services
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.connection_count()
    }

    /// Ids of the registered connections, sorted.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.shared.registry.connections()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }
}

impl Drop for MuxServer {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

async fn accept_loop(shared: Arc<Shared>, acceptor: Box<dyn Acceptor>) {
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                let id = ConnectionId::next();
                debug!(connection = %id, peer = %conn.peer, "Connection accepted");
                shared
                    .tasks
                    .spawn_on(serve_connection(Arc::clone(&shared), conn, id), &shared.handle);
            }
            Err(e) => {
                if shared.shutdown.is_cancelled() {
                    break;
                }
                warn!(error = %e, "Accept failed");
                tokio::select! {
                    () = shared.shutdown.cancelled() => break,
                    () = tokio::time::sleep(shared.config.accept_backoff) => {}
                }
            }
        }
    }
    info!(addr = %acceptor.local_addr(), "Accept loop stopped");
}

async fn serve_connection(shared: Arc<Shared>, conn: RawConnection, id: ConnectionId) {
    let peer = conn.peer.clone();

    let upgraded = tokio::select! {
        () = shared.shutdown.cancelled() => {
            debug!(connection = %id, peer = %peer, "Bootstrap abandoned, server stopping");
            return;
        }
        upgraded = shared.bootstrap.upgrade(conn) => upgraded,
    };
    let conn = match upgraded {
        Ok(conn) => conn,
        Err(e) => {
            warn!(connection = %id, peer = %peer, error = %e, "Bootstrap failed");
            return;
        }
    };

    let fiberized = tokio::select! {
        () = shared.shutdown.cancelled() => {
            debug!(connection = %id, peer = %peer, "Fiberization abandoned, server stopping");
            return;
        }
        fiberized = shared.fiberizer.fiberize(conn, id) => fiberized,
    };
    let session = match fiberized {
        Ok(session) => session,
        Err(e) => {
            warn!(connection = %id, peer = %peer, error = %e, "Fiberization failed");
            return;
        }
    };

    let manager = shared
        .managers
        .create(Arc::clone(&session), &shared.services, shared.config.relay_only);

    // Registered before start so a concurrent stop always sees it.
    let entry = RegistryEntry::new(Arc::clone(&session), Arc::clone(&manager));
    if let Err(refused) = shared.registry.register(id, entry) {
        debug!(connection = %id, peer = %peer, "Server stopping, discarding session");
        refused.shutdown();
        session.closed().await;
        return;
    }

    tokio::select! {
        started = manager.start() => match started {
            Ok(()) => {
                debug!(connection = %id, peer = %peer, "Services started");
                session.closed().await;
            }
            Err(e) => {
                warn!(connection = %id, peer = %peer, error = %e, "Service start failed, closing session");
                session.close();
            }
        },
        () = session.closed() => {
            debug!(connection = %id, peer = %peer, "Session closed during service start");
        }
    }

    if let Some(entry) = shared.registry.unregister(id) {
        entry.shutdown();
    }
    // Keeps this task, and so `join`, alive until the session is torn down.
    session.closed().await;
    info!(connection = %id, peer = %peer, "Connection closed");
}
