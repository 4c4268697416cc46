//! Pluggable per-connection message processing.
//!
//! The supervisor treats processors opaquely: it hands every inbound frame to
//! [`PipeProcessor::process_read`], drains [`PipeProcessor::listen_write`]
//! for unsolicited outbound messages, and calls [`PipeProcessor::close`] once
//! after the client's loops have exited.

pub mod echo;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::FrameKind;
use crate::errors::BoxError;

pub use echo::{EchoFabric, EchoProcessor};

/// Application logic bound to one connection.
#[async_trait]
pub trait PipeProcessor: Send + Sync + 'static {
    /// Handle one inbound frame.
    ///
    /// A non-empty reply is written back as a text frame before the next
    /// frame is read. An empty reply ends the connection gracefully. Called
    /// sequentially from the single reader task.
    async fn process_read(
        &self,
        cancel: &CancellationToken,
        kind: FrameKind,
        payload: Bytes,
    ) -> Result<Bytes, BoxError>;

    /// Outbound stream drained by the write task.
    ///
    /// Called once per client run. Dropping every sender ends the write side
    /// gracefully.
    fn listen_write(&self, cancel: CancellationToken) -> mpsc::Receiver<Bytes>;

    /// Release processor resources.
    async fn close(&self) -> Result<(), BoxError>;
}

/// Builds a [`PipeProcessor`] for a newly admitted connection.
#[async_trait]
pub trait PipeProcessorFabric: Send + Sync + 'static {
    /// Create the processor for `client_id`.
    async fn new_pipe_processor(
        &self,
        cancel: &CancellationToken,
        client_id: &str,
    ) -> Result<Arc<dyn PipeProcessor>, BoxError>;
}

/// A receiver whose stream is already finished.
pub fn closed_stream() -> mpsc::Receiver<Bytes> {
    let (_, rx) = mpsc::channel(1);
    rx
}
