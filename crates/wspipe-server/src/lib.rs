//! # wspipe-server
//!
//! Axum HTTP server in front of a [`wspipe::Manager`].
//!
//! - `/ws`: upgrades and hands the socket to `Manager::process`
//! - `/health`: status, uptime, and live client count
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use server::WsServer;
pub use shutdown::ShutdownCoordinator;
