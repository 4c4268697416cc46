//! Client registry, admission control, and bulk shutdown.
//!
//! [`Manager::process`] upgrades a request, builds a pipe processor, and
//! starts a detached [`Client`] owned by the manager's task tracker. Clients
//! report termination on the [`DeadSignal`]; [`Manager::run`] drains it and
//! reclaims registry entries.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::config::WsConfig;
use crate::connection::{Connection, Upgrade};
use crate::errors::{ClientCloseFailure, ConfigError, ManagerError, SetupError};
use crate::processor::{EchoFabric, PipeProcessor, PipeProcessorFabric};

// ─────────────────────────────────────────────────────────────────────────────
// DeadSignal
// ─────────────────────────────────────────────────────────────────────────────

/// Sending half of the "client terminated" notification channel.
///
/// Many clients emit; the manager's run loop receives. Closing is
/// signalled with a token rather than by dropping senders, so an emit that
/// races with shutdown resolves instead of blocking.
#[derive(Clone, Debug)]
pub struct DeadSignal {
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

/// Receiving half of the dead-signal channel.
#[derive(Debug)]
pub struct DeadSignalReceiver {
    rx: mpsc::Receiver<String>,
    closed: CancellationToken,
}

impl DeadSignal {
    /// Create a dead-signal channel buffering up to `capacity` ids.
    pub fn channel(capacity: usize) -> (Self, DeadSignalReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            Self {
                tx,
                closed: closed.clone(),
            },
            DeadSignalReceiver { rx, closed },
        )
    }

    /// Announce that `client_id` terminated. Returns `false` if the channel
    /// is closed.
    pub async fn emit(&self, client_id: &str) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.closed.cancelled() => false,
            sent = self.tx.send(client_id.to_owned()) => sent.is_ok(),
        }
    }

    /// Close the channel; pending and future emits return `false`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`DeadSignal::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl DeadSignalReceiver {
    /// Next terminated client id, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            id = self.rx.recv() => id,
        }
    }

    /// Non-blocking variant of [`DeadSignalReceiver::recv`].
    pub fn try_recv(&mut self) -> Option<String> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Registry and lifecycle owner for every live client.
pub struct Manager {
    config: WsConfig,
    fabric: Arc<dyn PipeProcessorFabric>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    closed: AtomicBool,
    dead_signal: DeadSignal,
    dead_rx: tokio::sync::Mutex<DeadSignalReceiver>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Builder for [`Manager`].
#[derive(Default)]
pub struct ManagerBuilder {
    fabric: Option<Arc<dyn PipeProcessorFabric>>,
    config: Option<WsConfig>,
}

impl ManagerBuilder {
    /// Processor fabric. Defaults to [`EchoFabric`].
    #[must_use]
    pub fn fabric(mut self, fabric: Arc<dyn PipeProcessorFabric>) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// Timing and sizing parameters. Defaults to [`WsConfig::default`].
    #[must_use]
    pub fn config(mut self, config: WsConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate the configuration and build the manager.
    pub fn build(self) -> Result<Arc<Manager>, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let fabric = self
            .fabric
            .unwrap_or_else(|| Arc::new(EchoFabric::default()));
        Ok(Arc::new(Manager::new(config, fabric)))
    }
}

impl Manager {
    fn new(config: WsConfig, fabric: Arc<dyn PipeProcessorFabric>) -> Self {
        let (dead_signal, dead_rx) = DeadSignal::channel(config.registry_capacity);
        Self {
            clients: Mutex::new(HashMap::with_capacity(config.registry_capacity)),
            config,
            fabric,
            closed: AtomicBool::new(false),
            dead_signal,
            dead_rx: tokio::sync::Mutex::new(dead_rx),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start building a manager.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// Fresh, time-ordered client id.
    pub fn next_client_id() -> String {
        format!("client_{}", Uuid::now_v7())
    }

    /// Active configuration.
    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Whether a client is registered under `client_id`.
    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.lock().contains_key(client_id)
    }

    /// Whether [`Manager::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Admit a connection.
    ///
    /// Setup (processor construction, registration, starting the client)
    /// runs in a manager-owned task so the client outlives `cancel`. Returns
    /// `Ok` once the client is registered or when the caller cancels,
    /// whichever happens first. Setup failures close the connection.
    #[instrument(skip_all, fields(client_id = %client_id))]
    pub async fn process(
        self: &Arc<Self>,
        client_id: String,
        request: impl Upgrade,
        cancel: &CancellationToken,
    ) -> Result<(), ManagerError> {
        if self.is_closed() {
            return Err(ManagerError::Closed);
        }

        let conn = request.upgrade().await.map_err(ManagerError::Upgrade)?;

        let (done_tx, done_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        drop(
            self.tasks
                .spawn(manager.serve(client_id, conn, done_tx).in_current_span()),
        );

        tokio::select! {
            () = cancel.cancelled() => {
                info!("caller cancelled during admission");
                Ok(())
            }
            outcome = done_rx => outcome.unwrap_or(Err(ManagerError::Setup {
                source: SetupError::Aborted,
                close_error: None,
            })),
            () = tokio::time::sleep(self.config.admission_timeout()) => {
                warn!("client setup exceeded admission timeout");
                Err(ManagerError::CreateConnTimeout)
            }
        }
    }

    async fn serve(
        self: Arc<Self>,
        client_id: String,
        conn: Arc<dyn Connection>,
        done: oneshot::Sender<Result<(), ManagerError>>,
    ) {
        let (client, processor) = match self.setup(&client_id, &conn).await {
            Ok(admitted) => admitted,
            Err(source) => {
                error!(error = %source, "client setup failed");
                let close_error = conn.close().await.err();
                if let Some(e) = &close_error {
                    error!(error = %e, "error closing connection after failed setup");
                }
                let _ = done.send(Err(ManagerError::Setup {
                    source,
                    close_error,
                }));
                return;
            }
        };
        let _ = done.send(Ok(()));

        match Arc::clone(&client).run(self.shutdown.clone()).await {
            Ok(()) => info!("client loop exited"),
            Err(e) => error!(error = %e, "client loop exited with error"),
        }

        if let Err(e) = processor.close().await {
            error!(error = %e, "error closing pipe processor");
        }
    }

    async fn setup(
        &self,
        client_id: &str,
        conn: &Arc<dyn Connection>,
    ) -> Result<(Arc<Client>, Arc<dyn PipeProcessor>), SetupError> {
        let processor = self
            .fabric
            .new_pipe_processor(&self.shutdown, client_id)
            .await
            .map_err(SetupError::Processor)?;

        let client = Arc::new(Client::new(
            client_id,
            Arc::clone(conn),
            Arc::clone(&processor),
            self.dead_signal.clone(),
            self.config.clone(),
        ));

        if let Err(e) = self.add_client(&client) {
            if let Err(close_err) = processor.close().await {
                error!(error = %close_err, "error closing pipe processor");
            }
            return Err(e);
        }
        Ok((client, processor))
    }

    fn add_client(&self, client: &Arc<Client>) -> Result<(), SetupError> {
        let mut clients = self.clients.lock();
        // Checked under the lock so close() cannot miss a late registration.
        if self.is_closed() {
            return Err(SetupError::ManagerClosed);
        }
        match clients.entry(client.id().to_owned()) {
            Entry::Occupied(_) => Err(SetupError::DuplicateClient(client.id().to_owned())),
            Entry::Vacant(slot) => {
                let _ = slot.insert(Arc::clone(client));
                Ok(())
            }
        }
    }

    /// Reclaim registry entries of terminated clients until `cancel` fires
    /// or the manager closes.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut dead = self.dead_rx.lock().await;
        loop {
            let client_id = tokio::select! {
                () = cancel.cancelled() => {
                    info!("manager run loop cancelled");
                    return;
                }
                next = dead.recv() => match next {
                    Some(id) => id,
                    None => {
                        info!("dead signal closed, manager run loop exiting");
                        return;
                    }
                },
            };

            if self.clients.lock().remove(&client_id).is_some() {
                info!(client_id = %client_id, "client removed");
            } else {
                error!(client_id = %client_id, "client not found");
            }
        }
    }

    /// Stop admitting, close every client, and close the dead signal.
    ///
    /// Idempotent. Returns every client close failure.
    pub async fn close(&self) -> Result<(), ManagerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let clients: Vec<Arc<Client>> = self.clients.lock().drain().map(|(_, c)| c).collect();
        info!(count = clients.len(), "closing clients");

        let outcomes = join_all(clients.iter().map(|client| async move {
            client.close().await.map_err(|error| ClientCloseFailure {
                client_id: client.id().to_owned(),
                error,
            })
        }))
        .await;

        let failures: Vec<ClientCloseFailure> = outcomes
            .into_iter()
            .filter_map(Result::err)
            .inspect(|f| error!(client_id = %f.client_id, error = %f.error, "error closing client"))
            .collect();

        self.dead_signal.close();
        self.shutdown.cancel();
        self.tasks.close();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Close(failures))
        }
    }

    /// Wait for every client task to finish after [`Manager::close`].
    ///
    /// Returns `false` if tasks were still running at `timeout`.
    pub async fn wait_for_clients(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok()
    }
}
