//! Funnel Server
//!
//! Tunnel endpoint that multiplexes accepted connections into sessions and
//! runs the configured services over each of them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use funnel_core::ServiceConfig;
use funnel_core::config::load_services;
use funnel_core::tracing_init::{default_filter, init_tracing};
use funnel_server::server::{MuxServer, ServerConfig};
use funnel_server::service::{LocalServiceManagerFactory, ServiceCatalog};
use funnel_server::tls::TlsMode;
use funnel_server::transport::TlsBootstrap;

/// How long `join` may take after stop before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "funnel-server")]
#[command(version, about = "Funnel server - multiplexed tunnel endpoint")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "FUNNEL_ADDR", default_value = "0.0.0.0:8011")]
    addr: String,

    /// JSON configuration file with a `services` section.
    #[arg(long, env = "FUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Allow remote hosts to connect to forwarded listener ports.
    #[arg(long, env = "FUNNEL_GATEWAY_PORTS")]
    gateway_ports: bool,

    /// Run as a relay: sessions forward channels onward.
    #[arg(long, env = "FUNNEL_RELAY_ONLY")]
    relay_only: bool,

    /// Enable dev TLS with auto-generated self-signed certificates.
    #[arg(long, conflicts_with = "tls_cert")]
    dev_tls: bool,

    /// Directory for generated dev certificates.
    #[arg(long, env = "FUNNEL_CERT_DIR", default_value = "certs")]
    cert_dir: PathBuf,

    /// Path to TLS certificate file (PEM).
    #[arg(long, env = "FUNNEL_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM).
    #[arg(long, env = "FUNNEL_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// TLS handshake timeout in seconds.
    #[arg(long, env = "FUNNEL_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    handshake_timeout: u64,

    /// Runtime worker threads. Defaults to the number of CPUs.
    #[arg(long, env = "FUNNEL_WORKER_THREADS")]
    worker_threads: Option<usize>,

    /// Log level for the funnel crates when `RUST_LOG` is unset.
    #[arg(long, env = "FUNNEL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FUNNEL_LOG_JSON")]
    log_json: bool,

    /// Print the service status and exit.
    #[arg(long)]
    status: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&default_filter(&args.log_level), args.log_json);

    let mut services = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading service configuration");
            load_services(path)?
        }
        None => ServiceConfig::default(),
    };
    if args.gateway_ports {
        services.set_gateway_ports(true);
    }

    services.log_enabled_status();
    if args.status {
        services.log_summary();
        info!(config = %services.to_document()?, "Effective service configuration");
        return Ok(());
    }

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = args.worker_threads {
        runtime.worker_threads(threads);
    }
    let runtime = runtime.build()?;

    runtime.block_on(serve(args, services))
}

async fn serve(args: Args, services: ServiceConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting funnel-server"
    );
    services.log_summary();

    // Determine TLS mode
    let tls_mode = if args.dev_tls {
        TlsMode::DevSelfSigned {
            cert_dir: args.cert_dir.clone(),
        }
    } else if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        TlsMode::Custom {
            cert_path: cert.clone(),
            key_path: key.clone(),
        }
    } else {
        TlsMode::Disabled
    };

    let catalog = service_catalog();
    if catalog.is_empty() {
        warn!("No service implementations registered, sessions will carry no services");
    } else {
        info!(kinds = ?catalog.kinds(), "Service implementations registered");
    }

    let mut builder = MuxServer::builder(services)
        .config(ServerConfig::default().with_relay_only(args.relay_only))
        .service_managers(Arc::new(LocalServiceManagerFactory::new(catalog)));
    if let Some(tls) = tls_mode.to_server_config()? {
        let timeout = Duration::from_secs(args.handshake_timeout);
        builder = builder.bootstrap(Arc::new(TlsBootstrap::new(tls, timeout)));
        info!(addr = %args.addr, "Server starting with TLS");
    } else {
        info!(addr = %args.addr, "Server starting (plaintext)");
    }

    let server = builder.build(tokio::runtime::Handle::current());
    let local_addr = server.run(&args.addr).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the server is ready (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %local_addr, "Server ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    server.stop();
    if tokio::time::timeout(SHUTDOWN_GRACE, server.join()).await.is_err() {
        warn!(
            connections = server.connection_count(),
            "Connection tasks still running after shutdown grace period"
        );
    }

    info!("Server stopped");
    Ok(())
}

/// Service implementations linked into this binary. Embedders register
/// their own factories through the library API.
fn service_catalog() -> ServiceCatalog {
    ServiceCatalog::new()
}
