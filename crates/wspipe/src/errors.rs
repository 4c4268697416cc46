//! Error hierarchy for connection supervision.
//!
//! - [`TransportError`]: failures reported by a [`Connection`](crate::Connection)
//! - [`ClientError`]: why a client's supervisor loops stopped
//! - [`ManagerError`]: admission and bulk-shutdown failures
//! - [`ConfigError`]: configuration loading failures
//!
//! Errors produced by pipe processors and fabrics are opaque [`BoxError`]s;
//! the supervisor never inspects them.

use thiserror::Error;

use crate::connection::FrameKind;

/// Opaque error produced by application code (processors, fabrics).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// WebSocket close codes the supervisor classifies.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (browser navigation, server restart).
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure reported by the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection (or it dropped) with the given code.
    #[error("connection closed (code {code}): {reason}")]
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason sent by the peer, possibly empty.
        reason: String,
    },

    /// A read or write deadline elapsed.
    #[error("i/o deadline exceeded")]
    Timeout,

    /// An inbound message exceeded the configured read limit.
    #[error("message of {size} bytes exceeds read limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The connection was closed locally; no further I/O is possible.
    #[error("use of closed connection")]
    AlreadyClosed,

    /// A text frame payload was not valid UTF-8.
    #[error("text frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// The frame kind is not valid for the attempted operation.
    #[error("frame kind {0:?} not supported here")]
    Unsupported(FrameKind),

    /// Lower-level socket or protocol failure.
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Close code carried by a [`TransportError::Closed`], if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is a close error whose code is not one of `expected`.
    ///
    /// Non-close errors are never "unexpected closes".
    pub fn is_unexpected_close(&self, expected: &[u16]) -> bool {
        self.close_code().is_some_and(|code| !expected.contains(&code))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ClientError
// ─────────────────────────────────────────────────────────────────────────────

/// Reason a client's supervisor stopped.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection was closed on purpose (normal closure or `close()`).
    #[error("connection closed properly")]
    ClosedProperly,

    /// The peer closed with an unexpected close code.
    #[error("connection closed incorrectly: {0}")]
    ClosedIncorrectly(#[source] TransportError),

    /// Any other read failure, including read-deadline expiry.
    #[error("unknown read exception: {0}")]
    UnknownRead(#[source] TransportError),

    /// The pipe processor rejected an inbound frame.
    #[error("error process read: {0}")]
    ProcessRead(#[source] BoxError),

    /// Writing a reply or an outbound message failed.
    #[error("error write answer: {0}")]
    Write(#[source] TransportError),

    /// Sending a keepalive ping failed.
    #[error("error sending ping: {0}")]
    Ping(#[source] TransportError),

    /// Transport parameters could not be applied before running.
    #[error("failed to configure connection: {0}")]
    Configure(#[source] TransportError),

    /// Closing the transport failed.
    #[error("failed to close connection: {0}")]
    Close(#[source] TransportError),

    /// `run` was called on a client that already ran.
    #[error("client is already running")]
    AlreadyRunning,

    /// A supervisor task panicked or was aborted.
    #[error("client task failed: {0}")]
    Task(String),
}

impl ClientError {
    /// Whether this outcome is a graceful shutdown rather than a failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::ClosedProperly)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ManagerError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure during asynchronous client setup, before the client is registered.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The fabric could not build a pipe processor.
    #[error("error creating pipe processor: {0}")]
    Processor(#[source] BoxError),

    /// A live client is already registered under this id.
    #[error("client {0} is already registered")]
    DuplicateClient(String),

    /// The manager closed while the client was being set up.
    #[error("manager is closed")]
    ManagerClosed,

    /// The setup task ended without reporting an outcome.
    #[error("setup task aborted")]
    Aborted,
}

/// A client that failed to close during [`Manager::close`](crate::Manager::close).
#[derive(Debug)]
pub struct ClientCloseFailure {
    /// Id of the client.
    pub client_id: String,
    /// Close failure.
    pub error: ClientError,
}

/// Admission or shutdown failure surfaced by the [`Manager`](crate::Manager).
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager no longer admits connections.
    #[error("manager is closed")]
    Closed,

    /// Setup did not finish within the admission timeout.
    #[error("create connection timeout")]
    CreateConnTimeout,

    /// The transport upgrade failed.
    #[error("upgrade failed: {0}")]
    Upgrade(#[source] TransportError),

    /// Client setup failed; the connection was closed best-effort.
    #[error("client setup failed: {source}")]
    Setup {
        /// Setup failure.
        #[source]
        source: SetupError,
        /// Error from closing the connection afterwards, if any.
        close_error: Option<TransportError>,
    },

    /// One or more clients failed to close during bulk shutdown.
    #[error("failed to close {} client(s)", .0.len())]
    Close(Vec<ClientCloseFailure>),
}

// ─────────────────────────────────────────────────────────────────────────────
// ConfigError
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse configuration JSON.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A configuration value was out of range.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
