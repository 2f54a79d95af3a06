//! In-memory fakes for driving `MuxServer` without sockets.
//!
//! Connections are `tokio::io::duplex` pairs pushed through a channel. The
//! peer name of a connection scripts how it is treated:
//! - `fail-*`: bootstrap fails
//! - `hang-*`: bootstrap never completes
//! - `nofiber-*`: fiberization fails
//! - anything else: passes straight through

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use funnel_core::ServiceConfig;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use funnel_server::error::{BootstrapError, FiberizeError, ServiceError};
use funnel_server::server::{MuxServer, ServerConfig};
use funnel_server::service::{
    LocalServiceManagerFactory, Microservice, ServiceCatalog, ServiceContext, ServiceFactory,
    ServiceKind, ServiceManager, ServiceManagerFactory, ServiceParams,
};
use funnel_server::session::{ConnectionId, Fiberizer, Session};
use funnel_server::transport::{
    Acceptor, BootstrapPolicy, BoxedStream, RawConnection, TransportBinder,
};

// =========================================================================
// Transport
// =========================================================================

/// Client side of the in-memory transport.
#[derive(Clone)]
pub struct Connector {
    tx: mpsc::UnboundedSender<io::Result<RawConnection>>,
}

impl Connector {
    /// Open a connection and return the client end.
    pub fn connect(&self, peer: &str) -> DuplexStream {
        let (client, server) = tokio::io::duplex(1024);
        self.tx.send(Ok(RawConnection::new(server, peer))).unwrap();
        client
    }

    /// Make the next accept fail.
    pub fn fail_accept(&self) {
        self.tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "accept failed")))
            .unwrap();
    }
}

pub struct MemoryTransport {
    rx: Mutex<Option<mpsc::UnboundedReceiver<io::Result<RawConnection>>>>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, Connector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                rx: Mutex::new(Some(rx)),
            }),
            Connector { tx },
        )
    }
}

#[async_trait]
impl TransportBinder for MemoryTransport {
    async fn bind(&self, query: &str) -> io::Result<Box<dyn Acceptor>> {
        let rx = self.rx.lock().unwrap().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "memory transport already bound")
        })?;
        Ok(Box::new(MemoryAcceptor {
            addr: format!("memory://{query}"),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct MemoryAcceptor {
    addr: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<RawConnection>>>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> io::Result<RawConnection> {
        match self.rx.lock().await.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

// =========================================================================
// Bootstrap
// =========================================================================

#[derive(Default)]
pub struct ScriptedBootstrap {
    pub failures: AtomicUsize,
    pub hanging: AtomicUsize,
    /// Hanging handshakes whose future was dropped.
    pub abandoned: Arc<AtomicUsize>,
    hang_started: Notify,
}

impl ScriptedBootstrap {
    /// Wait until `n` handshakes are hanging.
    pub async fn wait_hanging(&self, n: usize) {
        loop {
            let notified = self.hang_started.notified();
            if self.hanging.load(Ordering::SeqCst) >= n {
                return;
            }
            notified.await;
        }
    }
}

struct AbandonGuard(Arc<AtomicUsize>);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BootstrapPolicy for ScriptedBootstrap {
    async fn upgrade(&self, conn: RawConnection) -> Result<RawConnection, BootstrapError> {
        if conn.peer.starts_with("fail-") {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(BootstrapError::Handshake {
                peer: conn.peer,
                source: io::Error::new(io::ErrorKind::InvalidData, "bad hello"),
            });
        }
        if conn.peer.starts_with("hang-") {
            let _guard = AbandonGuard(Arc::clone(&self.abandoned));
            self.hanging.fetch_add(1, Ordering::SeqCst);
            self.hang_started.notify_waiters();
            std::future::pending::<()>().await;
        }
        Ok(conn)
    }
}

// =========================================================================
// Sessions
// =========================================================================

/// Session that closes when the client end of its stream goes away.
pub struct FakeSession {
    id: ConnectionId,
    pub peer: String,
    closed: CancellationToken,
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn open_channel(&self) -> Result<BoxedStream, FiberizeError> {
        Err(FiberizeError::Channel("fake session has no channels".into()))
    }

    async fn accept_channel(&self) -> Option<BoxedStream> {
        None
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[derive(Default)]
pub struct FakeFiberizer {
    pub failures: AtomicUsize,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFiberizer {
    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fiberizer for FakeFiberizer {
    async fn fiberize(
        &self,
        conn: RawConnection,
        id: ConnectionId,
    ) -> Result<Arc<dyn Session>, FiberizeError> {
        if conn.peer.starts_with("nofiber-") {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(FiberizeError::Setup("bad multiplexer header".into()));
        }

        let closed = CancellationToken::new();
        let session = Arc::new(FakeSession {
            id,
            peer: conn.peer,
            closed: closed.clone(),
        });

        let mut stream = conn.stream;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    () = closed.cancelled() => break,
                    read = stream.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            }
            closed.cancel();
        });

        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

// =========================================================================
// Service managers
// =========================================================================

/// Wraps another manager and counts calls.
pub struct CountingManager {
    pub id: ConnectionId,
    pub relay_only: bool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    fail_start: bool,
    inner: Arc<dyn ServiceManager>,
}

#[async_trait]
impl ServiceManager for CountingManager {
    async fn start(&self) -> Result<(), ServiceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(ServiceError::ServiceStart {
                service: ServiceKind::Socks,
                reason: "port already in use".into(),
            });
        }
        self.inner.start().await
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop();
    }
}

pub struct CountingManagers {
    inner: Arc<dyn ServiceManagerFactory>,
    pub fail_start: AtomicBool,
    managers: Mutex<Vec<Arc<CountingManager>>>,
}

impl CountingManagers {
    pub fn new(inner: Arc<dyn ServiceManagerFactory>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_start: AtomicBool::new(false),
            managers: Mutex::new(Vec::new()),
        })
    }

    pub fn managers(&self) -> Vec<Arc<CountingManager>> {
        self.managers.lock().unwrap().clone()
    }

    pub fn get(&self, id: ConnectionId) -> Arc<CountingManager> {
        self.managers()
            .into_iter()
            .find(|m| m.id == id)
            .unwrap()
    }
}

impl ServiceManagerFactory for CountingManagers {
    fn create(
        &self,
        session: Arc<dyn Session>,
        config: &ServiceConfig,
        relay_only: bool,
    ) -> Arc<dyn ServiceManager> {
        let manager = Arc::new(CountingManager {
            id: session.id(),
            relay_only,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start: self.fail_start.load(Ordering::SeqCst),
            inner: self.inner.create(session, config, relay_only),
        });
        self.managers.lock().unwrap().push(Arc::clone(&manager));
        manager
    }
}

// =========================================================================
// Services
// =========================================================================

#[derive(Default)]
pub struct ServiceLog {
    pub started: Mutex<Vec<(ConnectionId, ServiceParams)>>,
    pub stopped: AtomicUsize,
}

impl ServiceLog {
    pub fn started(&self) -> Vec<(ConnectionId, ServiceParams)> {
        self.started.lock().unwrap().clone()
    }
}

struct RecordingService {
    params: ServiceParams,
    log: Arc<ServiceLog>,
}

#[async_trait]
impl Microservice for RecordingService {
    async fn start(&self, ctx: ServiceContext) -> anyhow::Result<()> {
        self.log
            .started
            .lock()
            .unwrap()
            .push((ctx.connection_id, self.params.clone()));
        Ok(())
    }

    fn stop(&self) {
        self.log.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordingFactory {
    kind: ServiceKind,
    log: Arc<ServiceLog>,
}

impl ServiceFactory for RecordingFactory {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn create(&self, params: &ServiceParams) -> Box<dyn Microservice> {
        Box::new(RecordingService {
            params: params.clone(),
            log: Arc::clone(&self.log),
        })
    }
}

/// Service whose start never completes. Records entry into `started`.
struct HangingService {
    log: Arc<ServiceLog>,
    params: ServiceParams,
}

#[async_trait]
impl Microservice for HangingService {
    async fn start(&self, ctx: ServiceContext) -> anyhow::Result<()> {
        self.log
            .started
            .lock()
            .unwrap()
            .push((ctx.connection_id, self.params.clone()));
        std::future::pending().await
    }

    fn stop(&self) {
        self.log.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct HangingFactory {
    kind: ServiceKind,
    log: Arc<ServiceLog>,
}

impl ServiceFactory for HangingFactory {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn create(&self, params: &ServiceParams) -> Box<dyn Microservice> {
        Box::new(HangingService {
            log: Arc::clone(&self.log),
            params: params.clone(),
        })
    }
}

/// Catalog where `kind` never finishes starting.
pub fn hanging_catalog(kind: ServiceKind, log: &Arc<ServiceLog>) -> ServiceCatalog {
    let mut catalog = ServiceCatalog::new();
    catalog.register(Arc::new(HangingFactory {
        kind,
        log: Arc::clone(log),
    }));
    catalog
}

/// Catalog where each of `kinds` records into `log`.
pub fn recording_catalog(kinds: &[ServiceKind], log: &Arc<ServiceLog>) -> ServiceCatalog {
    let mut catalog = ServiceCatalog::new();
    for kind in kinds {
        catalog.register(Arc::new(RecordingFactory {
            kind: *kind,
            log: Arc::clone(log),
        }));
    }
    catalog
}

// =========================================================================
// Harness
// =========================================================================

pub struct Harness {
    pub server: MuxServer,
    pub connector: Connector,
    pub bootstrap: Arc<ScriptedBootstrap>,
    pub fiberizer: Arc<FakeFiberizer>,
    pub managers: Arc<CountingManagers>,
    pub services: Arc<ServiceLog>,
}

/// Start a server on the in-memory transport. Every service kind records
/// into `Harness::services`.
pub async fn start_server(services: ServiceConfig, config: ServerConfig) -> Harness {
    let log = Arc::new(ServiceLog::default());
    let catalog = recording_catalog(&ServiceKind::ALL, &log);
    start_server_with(services, config, catalog, log).await
}

/// Start a server whose service managers build from `catalog`.
pub async fn start_server_with(
    services: ServiceConfig,
    config: ServerConfig,
    catalog: ServiceCatalog,
    log: Arc<ServiceLog>,
) -> Harness {
    let (transport, connector) = MemoryTransport::new();
    let bootstrap = Arc::new(ScriptedBootstrap::default());
    let fiberizer = Arc::new(FakeFiberizer::default());
    let managers = CountingManagers::new(Arc::new(LocalServiceManagerFactory::new(catalog)));

    let server = MuxServer::builder(services)
        .config(config)
        .transport(transport)
        .bootstrap(bootstrap.clone())
        .fiberizer(fiberizer.clone())
        .service_managers(managers.clone())
        .build(Handle::current());
    server.run("test").await.unwrap();

    Harness {
        server,
        connector,
        bootstrap,
        fiberizer,
        managers,
        services: log,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Only `enabled` kinds turned on, everything else off.
pub fn only(enabled: &[ServiceKind]) -> ServiceConfig {
    let mut sections = serde_json::Map::new();
    for kind in ServiceKind::ALL {
        sections.insert(
            kind.as_str().to_string(),
            serde_json::json!({ "enable": enabled.contains(&kind) }),
        );
    }
    let mut config = ServiceConfig::default();
    config.update(&serde_json::Value::Object(sections)).unwrap();
    config
}
