//! nuwa relay daemon (nuwad)
//!
//! Serves shared-session documents to `TcpRemoteStore` clients.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (in-memory, port 6390)
//! nuwad
//!
//! # Custom port and configuration file
//! nuwad --port 7000 --config /etc/nuwa/nuwad.toml
//!
//! # PostgreSQL backing store (built with --features postgres)
//! nuwad --database-url postgres://localhost/nuwa
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nuwa_storage::{MemoryRemoteStore, RemoteStore};
use nuwa_transport::RelayServer;

use crate::config::{DaemonConfig, Overrides};

/// nuwa relay daemon
#[derive(Parser, Debug)]
#[command(name = "nuwad")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, env = "NUWA_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "NUWA_BIND")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "NUWA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "NUWA_LOG_LEVEL")]
    log_level: Option<String>,

    /// PostgreSQL connection string for the backing store
    #[arg(long, env = "NUWA_DATABASE_URL")]
    database_url: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            port: self.port,
            log_level: self.log_level.clone(),
            database_url: self.database_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref(), args.overrides())?;

    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let store = open_store(&config).await?;
    let addr = config.listen_addr()?;
    info!(addr = %addr, "Starting nuwa relay");

    let server = RelayServer::new(store, addr);
    let handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.abort();

    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store(config: &DaemonConfig) -> Result<Arc<dyn RemoteStore>> {
    match &config.database_url {
        Some(url) => {
            info!("Using PostgreSQL backing store");
            let store = nuwa_storage::PostgresRemoteStore::new(url).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Running in-memory only (no database url)");
            Ok(Arc::new(MemoryRemoteStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(config: &DaemonConfig) -> Result<Arc<dyn RemoteStore>> {
    if config.database_url.is_some() {
        anyhow::bail!("database url given but nuwad was built without the postgres feature");
    }
    info!("Running in-memory only");
    Ok(Arc::new(MemoryRemoteStore::new()))
}

fn print_banner() {
    println!(
        r#"
  ┳┓┳┳┓ ┏┏┓
  ┃┃┃┃┃┃┃┣┫
  ┛┗┗┛┗┻┛┛┗
  shared session relay
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
