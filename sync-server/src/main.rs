//! nexsync-server binary entry point.
//!
//! Usage:
//! ```bash
//! nexsync-server --config nexsync.toml
//! nexsync-server --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use nexodus_sync_server::config::Config;
use nexodus_sync_server::http::build_router;
use nexodus_sync_server::maintenance::{spawn_maintenance_task, DEFAULT_MAINTENANCE_INTERVAL};
use nexodus_sync_server::server::SyncServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Real-time watch engine for the Nexodus API server.
#[derive(Parser, Debug)]
#[command(name = "nexsync-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "nexsync.toml")]
    config: PathBuf,

    /// Override the bind address from the configuration
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("nexodus_sync_server=info,tower_http=warn,info")
            }),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    config.validate().context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    let bind_address = config.server.bind_address.clone();
    let server = Arc::new(
        SyncServer::from_config(config, shutdown.clone())
            .await
            .context("Failed to start sync server")?,
    );

    let maintenance = spawn_maintenance_task(
        server.rate_limits().clone(),
        DEFAULT_MAINTENANCE_INTERVAL,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    tracing::info!(
        address = %bind_address,
        version = env!("CARGO_PKG_VERSION"),
        "nexsync-server listening"
    );

    let app = build_router(Arc::clone(&server));
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
            // Open watch streams end with a close event.
            token.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = maintenance.await;
    tracing::info!("stopped");
    Ok(())
}
