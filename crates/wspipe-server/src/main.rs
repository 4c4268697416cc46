//! # wspipe-server
//!
//! Echo server binary: every connection gets an `EchoProcessor`.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use wspipe::config::load_config;
use wspipe::logging::init_subscriber;
use wspipe::processor::EchoFabric;
use wspipe_server::{ServerConfig, WsServer};

/// WebSocket echo server.
#[derive(Parser, Debug)]
#[command(name = "wspipe-server", about = "WebSocket echo server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8000")]
    port: u16,

    /// JSON file with connection settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for clients to drain on shutdown.
    #[arg(long, default_value = "10")]
    shutdown_timeout_secs: u64,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let ws = load_config(self.config.as_deref()).context("Failed to load configuration")?;
        Ok(ServerConfig {
            host: self.host.clone(),
            port: self.port,
            ws,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_subscriber(&args.log_level);

    let config = args.server_config()?;
    let server = WsServer::new(config, Arc::new(EchoFabric::default()))
        .context("Invalid server configuration")?;

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("wspipe listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let timeout = Duration::from_secs(args.shutdown_timeout_secs);
    if let Err(e) = server.shutdown().graceful_shutdown(Some(timeout)).await {
        tracing::warn!(error = %e, "some clients failed to close");
    }
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "server task failed");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
