//! [`Connection`] over an upgraded axum [`WebSocket`].
//!
//! The socket is split into a sink and a stream, each behind its own async
//! mutex. The sink mutex is the exclusive-write lock shared by every writer;
//! the stream mutex is held by the single reader. Closing cancels an internal
//! token so that blocked reads and writes return
//! [`TransportError::AlreadyClosed`] immediately.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CloseHandler, Connection, Frame, FrameKind, PongHandler, Upgrade};
use crate::errors::{TransportError, close_code};

/// Upper bound on the closing handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Axum WebSocket adapter.
pub struct WsConnection {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocket>>,
    read_limit: AtomicUsize,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    close_handler: Mutex<Option<CloseHandler>>,
    pong_handler: Mutex<Option<PongHandler>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl WsConnection {
    /// Wrap an upgraded socket. No limit or deadlines are set initially.
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            read_limit: AtomicUsize::new(usize::MAX),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            close_handler: Mutex::new(None),
            pong_handler: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    // Backstop for sockets upgraded without axum's own size limits.
    fn check_limit(&self, frame: Frame) -> Result<Frame, TransportError> {
        let limit = self.read_limit.load(Ordering::Relaxed);
        if frame.payload.len() > limit {
            return Err(TransportError::MessageTooLarge {
                size: frame.payload.len(),
                limit,
            });
        }
        Ok(frame)
    }

    fn on_pong(&self, data: Bytes) -> Result<(), TransportError> {
        match self.pong_handler.lock().as_ref() {
            Some(handler) => handler(data),
            None => Ok(()),
        }
    }

    async fn on_close(&self, code: u16, reason: String) {
        let callback = self.close_handler.lock().as_ref().map(|h| h(code, reason));
        if let Some(callback) = callback {
            callback.await;
        }
    }

    async fn send(&self, message: Message, deadline: Option<Instant>) -> Result<(), TransportError> {
        let write = async { self.sink.lock().await.send(message).await };
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::AlreadyClosed),
            sent = with_deadline(deadline, write) => {
                sent?.map_err(|e| TransportError::Io(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    fn set_read_deadline(&self, deadline: Instant) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        *self.read_deadline.lock() = Some(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Instant) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        *self.write_deadline.lock() = Some(deadline);
        Ok(())
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = Some(handler);
    }

    fn set_pong_handler(&self, handler: PongHandler) {
        *self.pong_handler.lock() = Some(handler);
    }

    async fn read_frame(&self) -> Result<Frame, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            // Re-read every iteration: the pong handler moves the deadline.
            let deadline = *self.read_deadline.lock();
            let next = tokio::select! {
                () = self.closed.cancelled() => return Err(TransportError::AlreadyClosed),
                next = with_deadline(deadline, stream.next()) => next?,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => {
                    return Err(TransportError::Closed {
                        code: close_code::ABNORMAL,
                        reason: String::new(),
                    });
                }
            };

            match message {
                Message::Text(text) => {
                    return self.check_limit(Frame::text(Bytes::copy_from_slice(
                        text.as_str().as_bytes(),
                    )));
                }
                Message::Binary(data) => return self.check_limit(Frame::binary(data)),
                Message::Pong(data) => self.on_pong(data)?,
                // Answered by the protocol layer.
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    let (code, reason) = frame.map_or_else(
                        || (close_code::NO_STATUS, String::new()),
                        |f| (f.code, f.reason.as_str().to_owned()),
                    );
                    self.on_close(code, reason.clone()).await;
                    return Err(TransportError::Closed { code, reason });
                }
            }
        }
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame.kind {
            FrameKind::Text => {
                let text = String::from_utf8(frame.payload.to_vec())
                    .map_err(|_| TransportError::InvalidUtf8)?;
                Message::Text(text.into())
            }
            FrameKind::Binary => Message::Binary(frame.payload),
            other => return Err(TransportError::Unsupported(other)),
        };
        let deadline = *self.write_deadline.lock();
        self.send(message, deadline).await
    }

    async fn write_control(
        &self,
        kind: FrameKind,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        let message = match kind {
            FrameKind::Ping => Message::Ping(payload),
            FrameKind::Pong => Message::Pong(payload),
            FrameKind::Close => Message::Close(Some(normal_close())),
            other => return Err(TransportError::Unsupported(other)),
        };
        self.send(message, Some(deadline)).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Releases any reader or writer parked on the socket halves.
        self.closed.cancel();

        let handshake = async {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(Some(normal_close()))).await {
                debug!(error = %e, "close frame not sent");
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "socket sink already closed");
            }
        };
        tokio::time::timeout(CLOSE_GRACE, handshake)
            .await
            .map_err(|_| TransportError::Timeout)
    }
}

#[async_trait]
impl Upgrade for WebSocket {
    async fn upgrade(self) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(WsConnection::new(self)))
    }
}

fn normal_close() -> CloseFrame {
    CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(""),
    }
}

/// Await `fut`, failing with [`TransportError::Timeout`] once `deadline` passes.
pub(crate) async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, TransportError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| TransportError::Timeout),
        None => Ok(fut.await),
    }
}
