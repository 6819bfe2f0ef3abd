//! Latency reporting
//!
//! The connection calls a [`Reporter`] around every correlated round trip
//! and every keepalive ping. Reporters run on the hot path, so the ones here
//! are either lock-free counters or a non-blocking bounded channel.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Observability hook for request latency
pub trait Reporter: Send + Sync + 'static {
    /// `name` is the connection name, `message` the request (or ping) payload
    fn latency(&self, name: &str, message: &[u8], elapsed: Duration);
}

/// Lock-free latency counters
///
/// Updated from the hot path, read via `snapshot` in the cold path.
pub struct LatencyMetrics {
    /// Samples recorded
    samples: AtomicU64,
    /// Sum of all latencies (microseconds)
    total_latency_us: AtomicU64,
    /// Worst latency seen (microseconds)
    max_latency_us: AtomicU64,
    /// Most recent latency (microseconds)
    last_latency_us: AtomicU64,
    /// Start time for rate calculation
    start_time: Instant,
}

/// Metrics snapshot for export
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub samples: u64,
    pub mean_latency: Duration,
    pub max_latency: Duration,
    pub last_latency: Duration,
    pub sample_rate: f64, // samples per second
    pub uptime_seconds: u64,
}

impl LatencyMetrics {
    pub fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record one latency sample
    #[inline]
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
        self.last_latency_us.store(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.samples.load(Ordering::Relaxed);
        let total = self.total_latency_us.load(Ordering::Relaxed);

        let uptime = self.start_time.elapsed().as_secs();
        let rate = if uptime > 0 {
            samples as f64 / uptime as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            samples,
            mean_latency: Duration::from_micros(total.checked_div(samples).unwrap_or(0)),
            max_latency: Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed)),
            last_latency: Duration::from_micros(self.last_latency_us.load(Ordering::Relaxed)),
            sample_rate: rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for LatencyMetrics {
    #[inline]
    fn latency(&self, _name: &str, _message: &[u8], elapsed: Duration) {
        self.record(elapsed);
    }
}

/// One reported latency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySample {
    pub name: String,
    pub message: Bytes,
    pub elapsed: Duration,
}

/// Forwards samples to a bounded channel, dropping them when it is full
pub struct ChannelReporter {
    tx: mpsc::Sender<LatencySample>,
    dropped: AtomicU64,
}

impl ChannelReporter {
    /// Reporter plus the receiving end, buffering up to `capacity` samples
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LatencySample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Samples lost to a full or closed channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Reporter for ChannelReporter {
    fn latency(&self, name: &str, message: &[u8], elapsed: Duration) {
        let sample = LatencySample {
            name: name.to_string(),
            message: Bytes::copy_from_slice(message),
            elapsed,
        };
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
