//! Keepalive scheduler
//!
//! Sends a ping every `delay` for as long as the connection lives, through
//! the same throttled path as application traffic. Either a native control
//! frame or an application-level message, depending on the exchange.
//! Failures are counted and logged, never fatal: deciding to reconnect is
//! the supervisor's job.

use crate::infrastructure::metrics::Reporter;
use crate::ws::transport::{FrameType, Transport};
use crate::ws::writer::ThrottledWriter;
use crate::{Result, StreamError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ping settings, fixed for the life of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingHandler {
    /// Use the protocol's own ping control frame
    pub native: bool,
    /// Frame type of the application-level ping (ignored when `native`)
    pub message_type: FrameType,
    /// Ping payload
    pub message: Bytes,
    /// Time between pings
    pub delay: Duration,
}

impl PingHandler {
    /// Protocol ping control frame with an empty payload
    pub fn native(delay: Duration) -> Self {
        Self {
            native: true,
            message_type: FrameType::Ping,
            message: Bytes::new(),
            delay,
        }
    }

    /// Application-level ping, e.g. `{"op":"ping"}` as a text frame
    pub fn message(message_type: FrameType, message: impl Into<Bytes>, delay: Duration) -> Self {
        Self {
            native: false,
            message_type,
            message: message.into(),
            delay,
        }
    }

    /// # Errors
    /// `Config` for a zero delay or an application ping without payload
    pub fn validate(&self) -> Result<()> {
        if self.delay.is_zero() {
            return Err(StreamError::Config("ping delay must be non-zero".to_string()));
        }
        if !self.native && self.message.is_empty() {
            return Err(StreamError::Config(
                "application-level ping needs a message".to_string(),
            ));
        }
        Ok(())
    }

    /// Frame actually written on each tick
    pub fn frame(&self) -> (FrameType, Bytes) {
        if self.native {
            (FrameType::Ping, self.message.clone())
        } else {
            (self.message_type, self.message.clone())
        }
    }
}

/// Liveness bookkeeping shared between reader, keepalive and supervisor
#[derive(Debug)]
pub struct KeepaliveHealth {
    /// Reference point for `last_activity`
    origin: Instant,
    /// Millis since `origin` of the last inbound frame
    last_activity: AtomicU64,
    pings_sent: AtomicU64,
    total_failures: AtomicU64,
    consecutive_failures: AtomicU32,
}

/// Health snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub pings_sent: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    /// Time since the last inbound frame
    pub idle: Duration,
}

impl KeepaliveHealth {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_activity: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Record an inbound frame
    #[inline]
    pub fn record_activity(&self) {
        let millis = self.origin.elapsed().as_millis() as u64;
        self.last_activity.store(millis, Ordering::Relaxed);
    }

    pub fn record_ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the consecutive failure count including this one
    pub fn record_ping_failure(&self) -> u32 {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reset for a fresh connection
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.record_activity();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time since the last inbound frame
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// No inbound traffic for longer than `max_idle`
    pub fn is_stale(&self, max_idle: Duration) -> bool {
        self.idle() > max_idle
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        ConnectionHealth {
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            idle: self.idle(),
        }
    }
}

impl Default for KeepaliveHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer loop writing pings for one connection
pub struct KeepaliveScheduler<T: Transport> {
    handler: PingHandler,
    writer: Arc<ThrottledWriter<T>>,
    health: Arc<KeepaliveHealth>,
    reporter: Option<Arc<dyn Reporter>>,
    /// Connection name passed to the reporter
    name: String,
}

impl<T: Transport> KeepaliveScheduler<T> {
    pub fn new(
        handler: PingHandler,
        writer: Arc<ThrottledWriter<T>>,
        health: Arc<KeepaliveHealth>,
        reporter: Option<Arc<dyn Reporter>>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            writer,
            health,
            reporter,
            name: name.into(),
        }
    }

    /// Run until `cancel` fires. First ping goes out one `delay` after start.
    pub async fn run(self, cancel: CancellationToken) {
        let delay = self.handler.delay;
        let (frame_type, payload) = self.handler.frame();
        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(target: "ws", name = %self.name, ?delay, %frame_type, "Keepalive started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let start = Instant::now();
            match self.writer.send(&cancel, frame_type, payload.clone()).await {
                Ok(()) => {
                    self.health.record_ping_sent();
                    if let Some(reporter) = &self.reporter {
                        reporter.latency(&self.name, &payload, start.elapsed());
                    }
                }
                Err(StreamError::Cancelled) => break,
                Err(e) => {
                    let failures = self.health.record_ping_failure();
                    warn!(
                        target: "ws",
                        name = %self.name,
                        error = %e,
                        consecutive_failures = failures,
                        "Keepalive ping failed"
                    );
                }
            }
        }

        debug!(target: "ws", name = %self.name, "Keepalive stopped");
    }
}
