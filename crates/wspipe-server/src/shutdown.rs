//! Graceful shutdown coordination via `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wspipe::{Manager, ManagerError};

/// Default time allowed for client tasks to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Stops the accept loop and drains the client manager.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    manager: Arc<Manager>,
}

impl ShutdownCoordinator {
    /// Create a coordinator for `manager`.
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            token: CancellationToken::new(),
            manager,
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown without closing clients.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Full shutdown:
    ///
    /// 1. Cancel the token (stops accepting, ends the registry loop)
    /// 2. Close every client through the manager
    /// 3. Wait up to `timeout` for client tasks to finish
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> Result<(), ManagerError> {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            clients = self.manager.client_count(),
            timeout_secs = timeout.as_secs(),
            "closing clients"
        );

        let closed = self.manager.close().await;

        if !self.manager.wait_for_clients(timeout).await {
            warn!("shutdown timed out after {timeout:?}, some clients may still be running");
        }
        closed
    }
}
