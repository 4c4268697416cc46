//! Reference processor: echoes every inbound payload and periodically pushes
//! a notice on the outbound stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{PipeProcessor, PipeProcessorFabric, closed_stream};
use crate::connection::FrameKind;
use crate::errors::BoxError;

/// Default interval between outbound notices.
pub const DEFAULT_NOTICE_INTERVAL: Duration = Duration::from_secs(5);

/// Default notice payload.
pub const DEFAULT_NOTICE: &str = "some msg default listen write";

/// Outbound buffer size.
const OUTBOUND_BUFFER: usize = 256;

/// Echoes reads; emits `notice` every `interval` on the write stream.
pub struct EchoProcessor {
    client_id: String,
    notice: Bytes,
    interval: Duration,
    listening: AtomicBool,
    stop: CancellationToken,
}

impl EchoProcessor {
    /// Create a processor for `client_id`.
    pub fn new(client_id: impl Into<String>, notice: impl Into<Bytes>, interval: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            notice: notice.into(),
            interval,
            listening: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl PipeProcessor for EchoProcessor {
    async fn process_read(
        &self,
        _cancel: &CancellationToken,
        kind: FrameKind,
        payload: Bytes,
    ) -> Result<Bytes, BoxError> {
        debug!(client_id = %self.client_id, ?kind, len = payload.len(), "echoing frame");
        Ok(payload)
    }

    fn listen_write(&self, cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return closed_stream();
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let notice = self.notice.clone();
        let interval = self.interval;
        let stop = self.stop.clone();
        drop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(notice.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
        rx
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.stop.cancel();
        Ok(())
    }
}

/// Builds an [`EchoProcessor`] per client.
#[derive(Clone, Debug)]
pub struct EchoFabric {
    notice: Bytes,
    interval: Duration,
}

impl EchoFabric {
    /// Fabric with a custom notice and interval.
    pub fn new(notice: impl Into<Bytes>, interval: Duration) -> Self {
        Self {
            notice: notice.into(),
            interval,
        }
    }
}

impl Default for EchoFabric {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE, DEFAULT_NOTICE_INTERVAL)
    }
}

#[async_trait]
impl PipeProcessorFabric for EchoFabric {
    async fn new_pipe_processor(
        &self,
        _cancel: &CancellationToken,
        client_id: &str,
    ) -> Result<Arc<dyn PipeProcessor>, BoxError> {
        Ok(Arc::new(EchoProcessor::new(
            client_id,
            self.notice.clone(),
            self.interval,
        )))
    }
}
