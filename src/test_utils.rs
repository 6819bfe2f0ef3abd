//! Test utilities: an in-memory transport
//!
//! Frames pushed with `inject` come out of `read_message` in order; every
//! write is recorded with the (possibly paused) tokio clock at the moment it
//! started.

use crate::ws::transport::{Endpoint, FrameType, Response, Transport};
use crate::{Result, StreamError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One recorded write
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub frame_type: FrameType,
    pub payload: Bytes,
    pub at: Instant,
}

pub struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Response>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Response>>,
    closed: Mutex<CancellationToken>,
    connected: AtomicBool,
    fail_dial: AtomicBool,
    fail_sends: AtomicBool,
    /// One-shot stall applied to the next write (socket backpressure)
    next_send_delay: Mutex<Option<Duration>>,
    next_shutdown_delay: Mutex<Option<Duration>>,
    dials: AtomicU32,
    shutdowns: AtomicU32,
    last_endpoint: Mutex<Option<Endpoint>>,
    sent: Mutex<Vec<SentFrame>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        closed.cancel();

        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed: Mutex::new(closed),
            connected: AtomicBool::new(false),
            fail_dial: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            next_send_delay: Mutex::new(None),
            next_shutdown_delay: Mutex::new(None),
            dials: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
            last_endpoint: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Queue a frame for the reader
    pub fn inject(&self, frame: Response) {
        let _ = self.inbound_tx.send(frame);
    }

    /// Queue a text frame
    pub fn inject_text(&self, text: &str) {
        self.inject(Response::text(Bytes::from(text.to_string())));
    }

    /// Simulate the remote side dropping the socket
    pub fn close_remote(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.lock().cancel();
    }

    pub fn fail_dial(&self, fail: bool) {
        self.fail_dial.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make the next write take `delay` before it completes
    pub fn delay_next_send(&self, delay: Duration) {
        *self.next_send_delay.lock() = Some(delay);
    }

    /// Make the next shutdown stall for `delay` before closing anything
    pub fn delay_next_shutdown(&self, delay: Duration) {
        *self.next_shutdown_delay.lock() = Some(delay);
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }

    /// Payloads of recorded writes of one frame type
    pub fn sent_of_type(&self, frame_type: FrameType) -> Vec<Bytes> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.frame_type == frame_type)
            .map(|f| f.payload.clone())
            .collect()
    }

    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.last_endpoint.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    async fn dial(&self, endpoint: &Endpoint) -> Result<()> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(StreamError::Transport("dial refused".to_string()));
        }

        *self.last_endpoint.lock() = Some(endpoint.clone());
        *self.closed.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_message(&self) -> Result<Response> {
        let closed = self.closed.lock().clone();
        if closed.is_cancelled() {
            return Err(StreamError::ConnectionClosed);
        }

        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(StreamError::ConnectionClosed),
            frame = inbound.recv() => frame.ok_or(StreamError::ConnectionClosed),
        }
    }

    async fn send_raw(&self, frame_type: FrameType, payload: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StreamError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(StreamError::Transport("write failed".to_string()));
        }

        let at = Instant::now();
        let delay = self.next_send_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push(SentFrame {
            frame_type,
            payload,
            at,
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        let delay = self.next_shutdown_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.closed.lock().cancel();
        Ok(())
    }
}
