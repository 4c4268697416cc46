//! Per-connection supervisor.
//!
//! A [`Client`] owns one [`Connection`] and one [`PipeProcessor`] and runs
//! four tasks against them under one cancellation scope:
//!
//! 1. **control**: waits for a close request from [`Client::close`]
//! 2. **read**: reads frames, hands them to the processor, writes replies
//! 3. **write**: drains the processor's outbound stream
//! 4. **ping**: sends keepalive pings every [`WsConfig::ping_period`]
//!
//! The first task to finish cancels the scope and closes the transport; the
//! others are awaited and the client id is emitted on the dead signal.
//!
//! Lifecycle: `Created → Configuring → Running → Closing → Closed`. States
//! only move forward.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, instrument, warn};

use crate::config::WsConfig;
use crate::connection::{Connection, Frame, FrameKind};
use crate::errors::{ClientError, TransportError, close_code};
use crate::manager::DeadSignal;
use crate::processor::PipeProcessor;

/// Close codes a peer may use without the close counting as incorrect.
const EXPECTED_CLOSE_CODES: [u16; 2] = [close_code::GOING_AWAY, close_code::ABNORMAL];

/// Supervisor lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    /// Constructed, `run` not yet called.
    Created = 0,
    /// Applying transport parameters.
    Configuring = 1,
    /// All four tasks live.
    Running = 2,
    /// Tasks unwinding, transport closing.
    Closing = 3,
    /// Transport closed and dead signal emitted.
    Closed = 4,
}

impl ClientState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Configuring,
            2 => Self::Running,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Supervisor for one connection.
pub struct Client {
    id: String,
    conn: Arc<dyn Connection>,
    processor: Arc<dyn PipeProcessor>,
    dead_signal: DeadSignal,
    config: WsConfig,
    state: AtomicU8,
    running: AtomicBool,
    closing: AtomicBool,
    transport_closed: AtomicBool,
    close_requested: CancellationToken,
}

impl Client {
    /// Create a client. Nothing runs until [`Client::run`].
    pub fn new(
        id: impl Into<String>,
        conn: Arc<dyn Connection>,
        processor: Arc<dyn PipeProcessor>,
        dead_signal: DeadSignal,
        config: WsConfig,
    ) -> Self {
        Self {
            id: id.into(),
            conn,
            processor,
            dead_signal,
            config,
            state: AtomicU8::new(ClientState::Created as u8),
            running: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            close_requested: CancellationToken::new(),
        }
    }

    /// Client id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn advance(&self, to: ClientState) {
        let _ = self.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    /// Configure the transport and supervise the connection until it ends.
    ///
    /// Always closes the transport and emits the dead signal on exit, even
    /// when configuration fails. Graceful endings (normal closure, empty
    /// processor reply, finished outbound stream, `close()`, cancellation)
    /// return `Ok`; otherwise the first failure is returned.
    #[instrument(skip_all, fields(client_id = %self.id))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ClientError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyRunning);
        }
        self.advance(ClientState::Configuring);

        let result = if self.close_requested.is_cancelled() {
            info!("close requested before run");
            Ok(())
        } else {
            match self.configure() {
                Ok(()) => {
                    self.advance(ClientState::Running);
                    Arc::clone(&self).supervise(cancel).await
                }
                Err(e) => {
                    error!(error = %e, "failed to configure connection");
                    Err(e)
                }
            }
        };

        self.advance(ClientState::Closing);
        if let Err(e) = self.close_transport().await {
            error!(error = %e, "error closing connection");
        }
        if !self.dead_signal.emit(&self.id).await {
            warn!("dead signal closed, registry cleanup skipped");
        }
        self.advance(ClientState::Closed);
        info!(ok = result.is_ok(), "client stopped");
        result
    }

    /// Request shutdown. Idempotent and safe to call concurrently; only the
    /// first call closes the transport.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.advance(ClientState::Closing);
        self.close_requested.cancel();
        self.close_transport().await
    }

    async fn close_transport(&self) -> Result<(), ClientError> {
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.conn.close().await.map_err(ClientError::Close)
    }

    fn configure(self: &Arc<Self>) -> Result<(), ClientError> {
        self.conn.set_read_limit(self.config.max_message_size);

        let weak = Arc::downgrade(self);
        self.conn.set_close_handler(Box::new(move |code, reason| {
            let weak = weak.clone();
            async move {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                info!(client_id = %client.id, code, reason = %reason, "connection closed");
                if let Err(e) = client.close().await {
                    error!(client_id = %client.id, error = %e, "error closing client after peer close");
                }
            }
            .boxed()
        }));

        self.conn
            .set_read_deadline(Instant::now() + self.config.pong_wait())
            .map_err(ClientError::Configure)?;

        let weak = Arc::downgrade(self);
        self.conn.set_pong_handler(Box::new(move |app_data| {
            let Some(client) = weak.upgrade() else {
                return Ok(());
            };
            info!(client_id = %client.id, app_data = ?app_data, "pong received");
            client
                .conn
                .set_read_deadline(Instant::now() + client.config.pong_wait())
                .inspect_err(|e| error!(client_id = %client.id, error = %e, "error setting read deadline"))
        }));

        Ok(())
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ClientError> {
        let scope = cancel.child_token();
        let mut tasks = JoinSet::new();
        let _ = tasks.spawn(Arc::clone(&self).control(scope.clone()).in_current_span());
        let _ = tasks.spawn(Arc::clone(&self).read_pipe(scope.clone()).in_current_span());
        let _ = tasks.spawn(Arc::clone(&self).write_pipe(scope.clone()).in_current_span());
        let _ = tasks.spawn(Arc::clone(&self).ping(scope.clone()).in_current_span());

        let mut failure = None;
        let mut ended = false;
        while let Some(joined) = tasks.join_next().await {
            // First task out ends the connection. Closing the transport is
            // what unblocks a pending read, even when the parent cancelled.
            if !ended {
                ended = true;
                scope.cancel();
                if let Err(e) = self.close_transport().await {
                    error!(error = %e, "error closing connection");
                }
            }
            let outcome = joined.unwrap_or_else(|e| Err(ClientError::Task(e.to_string())));
            if let Err(err) = outcome {
                if failure.is_none() && !err.is_graceful() {
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn control(self: Arc<Self>, scope: CancellationToken) -> Result<(), ClientError> {
        tokio::select! {
            () = scope.cancelled() => Ok(()),
            () = self.close_requested.cancelled() => Err(ClientError::ClosedProperly),
        }
    }

    async fn read_pipe(self: Arc<Self>, scope: CancellationToken) -> Result<(), ClientError> {
        loop {
            // Not raced against the scope: a read already inside the close
            // handler must still report the peer's close code.
            let frame = match self.conn.read_frame().await {
                Ok(frame) => frame,
                Err(e) => return self.read_failure(&scope, e),
            };

            let reply = self
                .processor
                .process_read(&scope, frame.kind, frame.payload)
                .await
                .map_err(ClientError::ProcessRead)?;

            if reply.is_empty() {
                info!("processor ended the connection");
                return Ok(());
            }

            if let Err(e) = self.write_text(reply).await {
                return self.settle(&scope, e, ClientError::Write);
            }
        }
    }

    async fn write_pipe(self: Arc<Self>, scope: CancellationToken) -> Result<(), ClientError> {
        let mut outbound = self.processor.listen_write(scope.clone());
        loop {
            tokio::select! {
                () = scope.cancelled() => {
                    info!("write pipe cancelled");
                    return Ok(());
                }
                next = outbound.recv() => {
                    let Some(payload) = next else {
                        info!("outbound stream closed");
                        return Ok(());
                    };
                    if let Err(e) = self.write_text(payload).await {
                        return self.settle(&scope, e, ClientError::Write);
                    }
                }
            }
        }
    }

    async fn ping(self: Arc<Self>, scope: CancellationToken) -> Result<(), ClientError> {
        let period = self.config.ping_period();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                () = scope.cancelled() => {
                    info!("ping cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let deadline = Instant::now() + self.config.write_wait();
                    if let Err(e) = self.conn.write_control(FrameKind::Ping, Bytes::new(), deadline).await {
                        return self.settle(&scope, e, ClientError::Ping);
                    }
                }
            }
        }
    }

    async fn write_text(&self, payload: Bytes) -> Result<(), TransportError> {
        self.conn
            .set_write_deadline(Instant::now() + self.config.write_wait())?;
        self.conn.write_frame(Frame::text(payload)).await
    }

    fn read_failure(&self, scope: &CancellationToken, err: TransportError) -> Result<(), ClientError> {
        if err.close_code() == Some(close_code::NORMAL) {
            return Err(ClientError::ClosedProperly);
        }
        if err.is_unexpected_close(&EXPECTED_CLOSE_CODES) {
            return Err(ClientError::ClosedIncorrectly(err));
        }
        self.settle(scope, err, ClientError::UnknownRead)
    }

    /// I/O failing because we closed the transport ourselves is not an error.
    fn settle(
        &self,
        scope: &CancellationToken,
        err: TransportError,
        wrap: fn(TransportError) -> ClientError,
    ) -> Result<(), ClientError> {
        let shutting_down = scope.is_cancelled() || self.close_requested.is_cancelled();
        if shutting_down && matches!(err, TransportError::AlreadyClosed) {
            return Ok(());
        }
        Err(wrap(err))
    }
}
