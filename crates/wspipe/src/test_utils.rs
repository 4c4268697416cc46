//! In-memory doubles for the transport and processor seams.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::ws::with_deadline;
use crate::connection::{CloseHandler, Connection, Frame, FrameKind, PongHandler};
use crate::errors::{BoxError, TransportError, close_code};
use crate::processor::{PipeProcessor, PipeProcessorFabric, closed_stream};

/// Poll `cond` until it holds, panicking after a generous bound.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

// ─────────────────────────────────────────────────────────────────────────────
// MockConnection
// ─────────────────────────────────────────────────────────────────────────────

/// What the scripted peer sends next.
pub(crate) enum Inbound {
    Frame(Frame),
    Pong(Bytes),
    Close(u16, String),
    Error(TransportError),
}

/// I/O the supervisor performed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Read,
    Write(Frame),
    Control(FrameKind),
    Close,
}

/// Scripted [`Connection`] recording every operation.
pub(crate) struct MockConnection {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    events: Mutex<Vec<Event>>,
    close_count: AtomicUsize,
    closed: CancellationToken,
    read_limit: AtomicUsize,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    close_handler: Mutex<Option<CloseHandler>>,
    pong_handler: Mutex<Option<PongHandler>>,
    fail_writes: AtomicBool,
    fail_controls: AtomicBool,
    fail_deadlines: AtomicBool,
    fail_close: AtomicBool,
    close_delay: Mutex<Option<Duration>>,
}

impl MockConnection {
    pub(crate) fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            events: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            read_limit: AtomicUsize::new(usize::MAX),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            close_handler: Mutex::new(None),
            pong_handler: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            fail_controls: AtomicBool::new(false),
            fail_deadlines: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            close_delay: Mutex::new(None),
        })
    }

    pub(crate) fn push_frame(&self, frame: Frame) {
        let _ = self.inbound_tx.send(Inbound::Frame(frame));
    }

    pub(crate) fn push_pong(&self) {
        let _ = self.inbound_tx.send(Inbound::Pong(Bytes::new()));
    }

    pub(crate) fn push_close(&self, code: u16, reason: &str) {
        let _ = self.inbound_tx.send(Inbound::Close(code, reason.to_owned()));
    }

    pub(crate) fn push_error(&self, err: TransportError) {
        let _ = self.inbound_tx.send(Inbound::Error(err));
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Relaxed);
    }

    pub(crate) fn fail_controls(&self) {
        self.fail_controls.store(true, Ordering::Relaxed);
    }

    pub(crate) fn fail_deadlines(&self) {
        self.fail_deadlines.store(true, Ordering::Relaxed);
    }

    pub(crate) fn fail_close(&self) {
        self.fail_close.store(true, Ordering::Relaxed);
    }

    /// Make `close` yield for `delay` before taking effect.
    pub(crate) fn delay_close(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn read_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Read))
            .count()
    }

    pub(crate) fn writes(&self) -> Vec<Frame> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Write(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn controls(&self) -> Vec<FrameKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Control(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn read_limit(&self) -> usize {
        self.read_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn read_deadline(&self) -> Option<Instant> {
        *self.read_deadline.lock()
    }

    pub(crate) fn write_deadline(&self) -> Option<Instant> {
        *self.write_deadline.lock()
    }

    fn check_deadline_setter(&self) -> Result<(), TransportError> {
        if self.fail_deadlines.load(Ordering::Relaxed) {
            return Err(TransportError::Io("deadline rejected".into()));
        }
        if self.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    fn set_read_deadline(&self, deadline: Instant) -> Result<(), TransportError> {
        self.check_deadline_setter()?;
        *self.read_deadline.lock() = Some(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Instant) -> Result<(), TransportError> {
        self.check_deadline_setter()?;
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
        self.events.lock().push(Event::Read);
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let deadline = *self.read_deadline.lock();
            let next = tokio::select! {
                () = self.closed.cancelled() => return Err(TransportError::AlreadyClosed),
                next = with_deadline(deadline, rx.recv()) => next?,
            };
            match next {
                Some(Inbound::Frame(frame)) => {
                    let limit = self.read_limit.load(Ordering::Relaxed);
                    if frame.payload.len() > limit {
                        return Err(TransportError::MessageTooLarge {
                            size: frame.payload.len(),
                            limit,
                        });
                    }
                    return Ok(frame);
                }
                Some(Inbound::Pong(data)) => {
                    if let Some(handler) = self.pong_handler.lock().as_ref() {
                        handler(data)?;
                    }
                }
                Some(Inbound::Close(code, reason)) => {
                    let callback = self
                        .close_handler
                        .lock()
                        .as_ref()
                        .map(|h| h(code, reason.clone()));
                    if let Some(callback) = callback {
                        callback.await;
                    }
                    return Err(TransportError::Closed { code, reason });
                }
                Some(Inbound::Error(err)) => return Err(err),
                None => {
                    return Err(TransportError::Closed {
                        code: close_code::ABNORMAL,
                        reason: String::new(),
                    });
                }
            }
        }
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TransportError::Io("broken pipe".into()));
        }
        self.events.lock().push(Event::Write(frame));
        Ok(())
    }

    async fn write_control(
        &self,
        kind: FrameKind,
        _payload: Bytes,
        _deadline: Instant,
    ) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        if self.fail_controls.load(Ordering::Relaxed) {
            return Err(TransportError::Io("broken pipe".into()));
        }
        self.events.lock().push(Event::Control(kind));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _ = self.close_count.fetch_add(1, Ordering::AcqRel);
        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.closed.cancel();
        self.events.lock().push(Event::Close);
        if self.fail_close.load(Ordering::Relaxed) {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Processors
// ─────────────────────────────────────────────────────────────────────────────

/// How a [`StubProcessor`] answers inbound frames.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Reply {
    Echo,
    Empty,
    Fail,
}

/// Processor with a scripted reply and a test-owned outbound stream.
pub(crate) struct StubProcessor {
    reply: Reply,
    outbound: Mutex<Option<mpsc::Receiver<Bytes>>>,
    close_calls: AtomicUsize,
}

impl StubProcessor {
    /// Processor plus the sender feeding its outbound stream. The stream
    /// stays open as long as the sender lives.
    pub(crate) fn new(reply: Reply) -> (Arc<Self>, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let processor = Arc::new(Self {
            reply,
            outbound: Mutex::new(Some(rx)),
            close_calls: AtomicUsize::new(0),
        });
        (processor, tx)
    }

    pub(crate) fn with_closed_outbound(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            outbound: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PipeProcessor for StubProcessor {
    async fn process_read(
        &self,
        _cancel: &CancellationToken,
        _kind: FrameKind,
        payload: Bytes,
    ) -> Result<Bytes, BoxError> {
        match self.reply {
            Reply::Echo => Ok(payload),
            Reply::Empty => Ok(Bytes::new()),
            Reply::Fail => Err("processor rejected frame".into()),
        }
    }

    fn listen_write(&self, _cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
        self.outbound.lock().take().unwrap_or_else(closed_stream)
    }

    async fn close(&self) -> Result<(), BoxError> {
        let _ = self.close_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Fabric handing out [`StubProcessor`]s, optionally slow or failing.
pub(crate) struct StubFabric {
    delay: Option<Duration>,
    fail: bool,
    created: Mutex<VecDeque<(String, Arc<StubProcessor>)>>,
    // Keeps every outbound stream open.
    senders: Mutex<Vec<mpsc::Sender<Bytes>>>,
}

impl StubFabric {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            fail: false,
            created: Mutex::new(VecDeque::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            fail: false,
            created: Mutex::new(VecDeque::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            delay: None,
            fail: true,
            created: Mutex::new(VecDeque::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn created(&self) -> Vec<String> {
        self.created.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub(crate) fn processor(&self, client_id: &str) -> Option<Arc<StubProcessor>> {
        self.created
            .lock()
            .iter()
            .find(|(id, _)| id == client_id)
            .map(|(_, p)| Arc::clone(p))
    }
}

#[async_trait]
impl PipeProcessorFabric for StubFabric {
    async fn new_pipe_processor(
        &self,
        _cancel: &CancellationToken,
        client_id: &str,
    ) -> Result<Arc<dyn PipeProcessor>, BoxError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err("fabric unavailable".into());
        }
        let (processor, tx) = StubProcessor::new(Reply::Echo);
        self.senders.lock().push(tx);
        self.created
            .lock()
            .push_back((client_id.to_owned(), Arc::clone(&processor)));
        Ok(processor)
    }
}
