//! Ferry Server
//!
//! Runs the WebSocket signaling relay, the offline transfer HTTP API and
//! the background sweepers for both.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: relay on 8080, HTTP API on 3000
//! ferry-server
//!
//! # Custom ports and storage location
//! ferry-server --signal-port 9000 --http-port 9001 --data-dir /var/lib/ferry
//! ```

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ferry_core::Config;
use ferry_server::{build_router, AppState};
use ferry_signal::{MemoryRegistry, Relay, RoomRegistry, SignalServer};
use ferry_store::{OfflineSweeper, SqliteStore, StoreLimits, TransferStore};

#[derive(Parser, Debug)]
#[command(name = "ferry-server")]
#[command(about = "Ferry signaling relay and offline transfer server")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the per-user config location)
    #[arg(short, long, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long, env = "FERRY_BIND")]
    bind: Option<IpAddr>,

    /// WebSocket signaling port
    #[arg(long, env = "FERRY_SIGNAL_PORT")]
    signal_port: Option<u16>,

    /// HTTP API port
    #[arg(long, env = "FERRY_HTTP_PORT")]
    http_port: Option<u16>,

    /// Directory for offline transfers
    #[arg(short, long, env = "FERRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Load the configuration file and apply command line overrides
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("failed to load config from {:?}", path))?,
            None => Config::load(),
        };

        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.signal_port {
            config.server.signal_port = port;
        }
        if let Some(port) = self.http_port {
            config.server.http_port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.offline.data_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    let config = args.config()?;
    let signal_addr = SocketAddr::new(config.server.bind, config.server.signal_port);
    let http_addr = SocketAddr::new(config.server.bind, config.server.http_port);

    info!("Starting Ferry Server");

    // Offline store
    let data_dir = config.data_dir();
    info!("Using data directory: {:?}", data_dir);
    let store: Arc<dyn TransferStore> = Arc::new(
        SqliteStore::open(&data_dir, StoreLimits::from(&config.offline))
            .context("failed to open offline store")?,
    );
    info!("Loaded {} offline transfers", store.len().unwrap_or(0));

    // Signaling relay
    let rooms: Arc<dyn RoomRegistry> =
        Arc::new(MemoryRegistry::with_max_age(config.rooms.max_age()));
    let relay = Arc::new(Relay::new(Arc::clone(&rooms)));
    let signal = SignalServer::new(relay, &config.rooms);
    let signal_task = tokio::spawn(async move { signal.serve(signal_addr).await });

    // Offline sweeper
    tokio::spawn(OfflineSweeper::new(Arc::clone(&store), &config.offline).run_loop());

    // HTTP API
    let app = build_router(AppState::new(store, rooms, config.offline.clone()));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP API on {}", http_addr))?;
    info!("HTTP API listening on {}", http_addr);

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.context("HTTP API failed")?;
        }
        result = signal_task => {
            result
                .context("signal server task panicked")?
                .context("signal server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
