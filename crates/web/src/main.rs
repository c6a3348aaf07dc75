//! uiproxy
//!
//! Authenticated reverse proxy for per-instance container web UIs.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use uiproxy_common::Database;
use uiproxy_web::auth::{AccessGate, JwtIdentityService};
use uiproxy_web::{ProxyConfig, WebServer};

#[derive(Parser)]
#[command(name = "uiproxy")]
#[command(about = "Authenticated reverse proxy for instance web UIs")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "uiproxy.toml")]
    config: PathBuf,

    /// Listen address (overrides config and UIPROXY_LISTEN)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// SQLite database path (overrides config and UIPROXY_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("uiproxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ProxyConfig::load(&cli.config)?.apply_env()?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate()?;

    if config.uses_dev_secret() {
        warn!("Using the built-in development JWT secret; set UIPROXY_JWT_SECRET");
    }

    let db = Database::open(&config.db_path)?;
    info!("Reading instances from {}", config.db_path.display());

    let identity = JwtIdentityService::new(&config.jwt.secret, config.jwt.algorithm()?, Arc::new(db.clone()));
    let gate = AccessGate::new(Arc::new(identity), Arc::new(db));

    info!(
        "Serving instance UIs on http://{} (upstream host: {})",
        config.listen, config.upstream_host
    );
    WebServer::new(config, gate)?.serve().await
}
