//! Transport capability consumed by the client supervisor.
//!
//! A [`Connection`] reads and writes typed frames, sends control frames,
//! tracks read/write deadlines, and closes. Control frames received from the
//! peer never surface from [`Connection::read_frame`]: pongs go to the
//! installed pong handler, and a close frame goes to the close handler before
//! the read fails with [`TransportError::Closed`].
//!
//! Implementations must serialize concurrent writers: the read-reply path,
//! the write task, and the ping task all write through the same `&self`.

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::errors::TransportError;

pub use ws::WsConnection;

/// Frame type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// UTF-8 text payload.
    Text,
    /// Arbitrary binary payload.
    Binary,
    /// Liveness probe.
    Ping,
    /// Liveness probe answer.
    Pong,
    /// Closing handshake.
    Close,
}

impl FrameKind {
    /// Whether this is a protocol-level control frame.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Close)
    }
}

/// One message unit: a type tag plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub kind: FrameKind,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// A text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload: payload.into(),
        }
    }

    /// A binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            payload: payload.into(),
        }
    }
}

/// Invoked with `(code, reason)` when the peer sends a close frame.
pub type CloseHandler = Box<dyn Fn(u16, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with the application data of every pong received.
///
/// An error fails the in-progress read.
pub type PongHandler = Box<dyn Fn(Bytes) -> Result<(), TransportError> + Send + Sync>;

/// Duplex frame channel to one peer.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Maximum accepted inbound payload size.
    fn set_read_limit(&self, limit: usize);

    /// Deadline for reads; a read still pending at `deadline` fails with
    /// [`TransportError::Timeout`].
    fn set_read_deadline(&self, deadline: Instant) -> Result<(), TransportError>;

    /// Deadline applied to subsequent [`Connection::write_frame`] calls.
    fn set_write_deadline(&self, deadline: Instant) -> Result<(), TransportError>;

    /// Install the peer-close callback.
    fn set_close_handler(&self, handler: CloseHandler);

    /// Install the pong callback.
    fn set_pong_handler(&self, handler: PongHandler);

    /// Read the next text or binary frame.
    async fn read_frame(&self) -> Result<Frame, TransportError>;

    /// Write a text or binary frame under the current write deadline.
    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError>;

    /// Write a control frame under its own deadline.
    async fn write_control(
        &self,
        kind: FrameKind,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<(), TransportError>;

    /// Close the connection, unblocking pending reads and writes.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Turns an accepted request into a [`Connection`].
#[async_trait]
pub trait Upgrade: Send + 'static {
    /// Perform the upgrade.
    async fn upgrade(self) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
impl Upgrade for Arc<dyn Connection> {
    async fn upgrade(self) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_kinds() {
        assert!(FrameKind::Ping.is_control());
        assert!(FrameKind::Pong.is_control());
        assert!(FrameKind::Close.is_control());
        assert!(!FrameKind::Text.is_control());
        assert!(!FrameKind::Binary.is_control());
    }

    #[test]
    fn frame_constructors_set_kind() {
        let text = Frame::text("hello");
        assert_eq!(text.kind, FrameKind::Text);
        assert_eq!(&text.payload[..], b"hello");

        let bin = Frame::binary(vec![1u8, 2, 3]);
        assert_eq!(bin.kind, FrameKind::Binary);
        assert_eq!(bin.payload.len(), 3);
    }
}
