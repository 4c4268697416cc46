//! `WsServer`: axum HTTP server feeding WebSocket upgrades to the manager.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wspipe::{ConfigError, Manager, PipeProcessorFabric};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Client manager admitting every upgraded socket.
    pub manager: Arc<Manager>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
}

/// The wspipe server.
pub struct WsServer {
    config: ServerConfig,
    manager: Arc<Manager>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl WsServer {
    /// Create a server whose clients get processors from `fabric`.
    pub fn new(
        config: ServerConfig,
        fabric: Arc<dyn PipeProcessorFabric>,
    ) -> Result<Self, ConfigError> {
        let manager = Manager::builder()
            .fabric(fabric)
            .config(config.ws.clone())
            .build()?;
        Ok(Self {
            config,
            shutdown: Arc::new(ShutdownCoordinator::new(Arc::clone(&manager))),
            manager,
            start_time: Instant::now(),
        })
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Bind, then serve HTTP and drain the manager's dead signal in the
    /// background until the shutdown token fires.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;

        let token = self.shutdown.token();
        let manager = Arc::clone(&self.manager);
        let serve = axum::serve(listener, self.router())
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .into_future();

        let handle = tokio::spawn(async move {
            let ((), served) = tokio::join!(manager.run(token), serve);
            if let Err(e) = served {
                error!(error = %e, "server exited with error");
            }
        });

        info!(%addr, "wspipe server started");
        Ok((addr, handle))
    }

    /// Get the client manager.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.manager.client_count(),
        state.manager.is_closed(),
    );
    Json(resp)
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.manager.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    // Oversized frames are rejected while being read, not after buffering.
    let limit = state.manager.config().max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Manager::next_client_id();
    info!(client_id = %client_id, "WebSocket client connected");

    let cancel = state.shutdown.token();
    if let Err(e) = state.manager.process(client_id.clone(), socket, &cancel).await {
        warn!(client_id = %client_id, error = %e, "connection not admitted");
    }
}
