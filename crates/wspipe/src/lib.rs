//! # wspipe
//!
//! WebSocket connection lifecycle management.
//!
//! - **Connection**: transport capability (typed frames, control frames,
//!   deadlines, close) with an axum adapter in [`connection::ws`]
//! - **Pipe processors**: pluggable per-connection message handling created by
//!   a [`PipeProcessorFabric`]
//! - **Client**: per-connection supervisor running control, read, write, and
//!   ping tasks under one cancellation scope
//! - **Manager**: admission control, client registry, dead-signal draining,
//!   and bulk shutdown
//!
//! Everything is logged through `tracing`; binaries install a subscriber with
//! [`logging::init_subscriber`].

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod logging;
pub mod manager;
pub mod processor;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::{Client, ClientState};
pub use config::WsConfig;
pub use connection::{Connection, Frame, FrameKind, Upgrade};
pub use errors::{BoxError, ClientError, ConfigError, ManagerError, SetupError, TransportError};
pub use manager::{DeadSignal, DeadSignalReceiver, Manager, ManagerBuilder};
pub use processor::{PipeProcessor, PipeProcessorFabric};
