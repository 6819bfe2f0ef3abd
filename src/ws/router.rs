//! Response router
//!
//! Owns the single reader loop of a connection and the waiter table. Every
//! inbound frame is asked for its signature exactly once, then either
//! appended to the live waiter for that signature or handed to the feed
//! sink. A waiter leaves the table exactly once: resolved by the reader,
//! expired by its deadline, abandoned by its caller, or failed on close.
//! Whoever removes it from the table is the only one allowed to settle it.

use crate::ws::feed::FeedSink;
use crate::ws::signature::{Signature, SignatureExtractor};
use crate::ws::transport::{Response, Transport};
use crate::{Result, StreamError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type ReplySender = oneshot::Sender<Result<Vec<Bytes>>>;

/// A pending correlated request
struct Waiter {
    /// Distinguishes this registration from a later one on the same signature
    token: u64,
    expected: usize,
    replies: Vec<Bytes>,
    deadline: Instant,
    tx: ReplySender,
}

struct WaiterTable {
    waiters: HashMap<Signature, Waiter>,
    /// Set on connection close; no registrations until reopened
    closed: bool,
}

/// Router behaviour knobs
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// Hand frames whose signature matches no live waiter to the feed sink
    /// instead of dropping them
    pub forward_unmatched_replies: bool,
    /// Maximum live waiters (0 = unlimited)
    pub max_pending_requests: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            forward_unmatched_replies: false,
            max_pending_requests: 1024,
        }
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Last expected reply arrived; waiter completed
    Resolved(Signature),
    /// Reply stored, waiter still needs more
    Accumulated {
        signature: Signature,
        received: usize,
        expected: usize,
    },
    /// Sent to the feed sink
    Unsolicited,
    /// Had a signature but nobody was waiting for it
    Dropped(Signature),
    /// Arrived after the waiter's deadline; the waiter timed out and the
    /// frame was discarded
    Expired(Signature),
    /// Ping, pong or close; counted as activity, never routed
    Control,
}

#[derive(Debug, Default)]
struct RouterCounters {
    correlated: AtomicU64,
    resolved: AtomicU64,
    unsolicited: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    closed: AtomicU64,
}

/// Router statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterStats {
    /// Frames matched to a live waiter
    pub correlated_frames: u64,
    /// Waiters completed successfully
    pub resolved: u64,
    /// Frames handed to the feed sink
    pub unsolicited_frames: u64,
    /// Late or duplicate replies discarded
    pub dropped_frames: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Waiters failed by connection close
    pub closed: u64,
    /// Live waiters right now
    pub pending: usize,
}

pub struct ResponseRouter {
    table: Mutex<WaiterTable>,
    extractor: Arc<dyn SignatureExtractor>,
    sink: Arc<dyn FeedSink>,
    options: RouterOptions,
    next_token: AtomicU64,
    counters: RouterCounters,
}

impl ResponseRouter {
    pub fn new(
        extractor: Arc<dyn SignatureExtractor>,
        sink: Arc<dyn FeedSink>,
        options: RouterOptions,
    ) -> Self {
        Self {
            table: Mutex::new(WaiterTable {
                waiters: HashMap::new(),
                closed: false,
            }),
            extractor,
            sink,
            options,
            next_token: AtomicU64::new(1),
            counters: RouterCounters::default(),
        }
    }

    /// Register intent to wait for `expected` replies carrying `signature`
    ///
    /// Register before sending the request so a fast reply cannot slip past.
    ///
    /// # Errors
    /// - `DuplicateCorrelation` if the signature already has a live waiter
    /// - `TooManyPending` at capacity
    /// - `ConnectionClosed` after `close_all` until `reopen`
    /// - `InvalidRequest` for `expected == 0` or a zero timeout
    pub fn wait_for(
        self: &Arc<Self>,
        signature: Signature,
        expected: usize,
        timeout: Duration,
    ) -> Result<WaitHandle> {
        if expected == 0 {
            return Err(StreamError::InvalidRequest(
                "expected reply count must be at least 1".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(StreamError::InvalidRequest(
                "response timeout must be non-zero".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        {
            let mut table = self.table.lock();
            if table.closed {
                return Err(StreamError::ConnectionClosed);
            }
            if table.waiters.contains_key(&signature) {
                return Err(StreamError::DuplicateCorrelation(signature));
            }
            let max = self.options.max_pending_requests;
            if max > 0 && table.waiters.len() >= max {
                return Err(StreamError::TooManyPending(max));
            }

            table.waiters.insert(
                signature.clone(),
                Waiter {
                    token,
                    expected,
                    replies: Vec::with_capacity(expected),
                    deadline,
                    tx,
                },
            );
        }

        Ok(WaitHandle {
            router: Arc::clone(self),
            signature,
            token,
            expected,
            deadline,
            rx,
            settled: false,
        })
    }

    /// Classify one inbound frame
    pub fn route(&self, frame: Response) -> Routed {
        if frame.frame_type.is_control() {
            return Routed::Control;
        }

        if let Some(signature) = self.extractor.extract(&frame) {
            let mut table = self.table.lock();

            if let Some(waiter) = table.waiters.get_mut(&signature) {
                if waiter.deadline <= Instant::now() {
                    // Too late to count; the waiter times out instead of the sweeper doing it
                    if let Some(waiter) = table.waiters.remove(&signature) {
                        let _ = waiter.tx.send(Err(StreamError::Timeout {
                            signature: signature.clone(),
                            expected: waiter.expected,
                            received: waiter.replies.len(),
                        }));
                    }
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return Routed::Expired(signature);
                }

                waiter.replies.push(frame.raw);
                let received = waiter.replies.len();
                let expected = waiter.expected;
                self.counters.correlated.fetch_add(1, Ordering::Relaxed);

                if received < expected {
                    return Routed::Accumulated {
                        signature,
                        received,
                        expected,
                    };
                }

                if let Some(waiter) = table.waiters.remove(&signature) {
                    // Settled under the lock so a racing abandon always finds the result
                    let _ = waiter.tx.send(Ok(waiter.replies));
                }
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                return Routed::Resolved(signature);
            }
            drop(table);

            if !self.options.forward_unmatched_replies {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(target: "ws", %signature, "Dropping reply with no live waiter");
                return Routed::Dropped(signature);
            }
        }

        self.counters.unsolicited.fetch_add(1, Ordering::Relaxed);
        self.sink.deliver(frame);
        Routed::Unsolicited
    }

    /// Fail every live waiter with `ConnectionClosed` and refuse new ones
    ///
    /// Returns the number of waiters failed.
    pub fn close_all(&self) -> usize {
        let mut table = self.table.lock();
        table.closed = true;

        let count = table.waiters.len();
        for (_, waiter) in table.waiters.drain() {
            let _ = waiter.tx.send(Err(StreamError::ConnectionClosed));
        }
        self.counters
            .closed
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Accept registrations again (new connection, empty table)
    pub fn reopen(&self) {
        self.table.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Expire every waiter whose deadline is at or before `now`
    ///
    /// Partial replies are discarded with the waiter. Returns the number expired.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let mut table = self.table.lock();
        let overdue: Vec<Signature> = table
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.deadline <= now)
            .map(|(signature, _)| signature.clone())
            .collect();

        for signature in &overdue {
            if let Some(waiter) = table.waiters.remove(signature) {
                let _ = waiter.tx.send(Err(StreamError::Timeout {
                    signature: signature.clone(),
                    expected: waiter.expected,
                    received: waiter.replies.len(),
                }));
            }
        }
        self.counters
            .timed_out
            .fetch_add(overdue.len() as u64, Ordering::Relaxed);
        overdue.len()
    }

    /// Live waiters
    pub fn pending(&self) -> usize {
        self.table.lock().waiters.len()
    }

    pub fn is_pending(&self, signature: &Signature) -> bool {
        self.table.lock().waiters.contains_key(signature)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            correlated_frames: self.counters.correlated.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            unsolicited_frames: self.counters.unsolicited.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Remove the waiter only if it is still the registration `token` made
    fn remove_if_token(&self, signature: &Signature, token: u64) -> Option<Waiter> {
        let mut table = self.table.lock();
        match table.waiters.get(signature) {
            Some(waiter) if waiter.token == token => table.waiters.remove(signature),
            _ => None,
        }
    }

    /// Reader loop: pull frames until the transport reports the socket gone
    ///
    /// `on_frame` runs for every frame before routing (activity tracking).
    /// On exit every live waiter is failed with `ConnectionClosed`; the
    /// transport's terminating error is returned.
    pub async fn run_reader<T, F>(self: Arc<Self>, transport: Arc<T>, on_frame: F) -> StreamError
    where
        T: Transport,
        F: Fn(&Response) + Send,
    {
        let error = loop {
            match transport.read_message().await {
                Ok(frame) => {
                    on_frame(&frame);
                    self.route(frame);
                }
                Err(e) => break e,
            }
        };

        let failed = self.close_all();
        debug!(target: "ws", error = %error, failed_waiters = failed, "Reader loop stopped");
        error
    }

    /// Periodically expire overdue waiters until `cancel` fires
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.expire_overdue(Instant::now());
                    if expired > 0 {
                        debug!(target: "ws", expired, "Expired overdue waiters");
                    }
                }
            }
        }
    }
}

/// Caller side of a pending request
///
/// Dropping the handle before it settles removes the waiter from the table.
pub struct WaitHandle {
    router: Arc<ResponseRouter>,
    signature: Signature,
    token: u64,
    expected: usize,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Vec<Bytes>>>,
    settled: bool,
}

enum WaitOutcome {
    Settled(std::result::Result<Result<Vec<Bytes>>, oneshot::error::RecvError>),
    DeadlinePassed,
    Cancelled,
}

impl WaitHandle {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Block until all replies arrive, the deadline passes, `cancel` fires
    /// or the connection closes. All-or-nothing: partial replies are never
    /// returned.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Vec<Bytes>> {
        let outcome = tokio::select! {
            biased;
            result = &mut self.rx => WaitOutcome::Settled(result),
            _ = tokio::time::sleep_until(self.deadline) => WaitOutcome::DeadlinePassed,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        match outcome {
            WaitOutcome::Settled(result) => {
                self.settled = true;
                result.unwrap_or(Err(StreamError::ConnectionClosed))
            }
            WaitOutcome::DeadlinePassed => self.abandon(false),
            WaitOutcome::Cancelled => self.abandon(true),
        }
    }

    /// Give up because the deadline passed before the request was written
    ///
    /// Counted as a timeout, unlike a plain drop.
    pub fn expire(mut self) -> Result<Vec<Bytes>> {
        self.abandon(false)
    }

    fn abandon(&mut self, cancelled: bool) -> Result<Vec<Bytes>> {
        self.settled = true;

        match self.router.remove_if_token(&self.signature, self.token) {
            Some(waiter) => {
                if cancelled {
                    self.router.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    Err(StreamError::Cancelled)
                } else {
                    self.router.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    Err(StreamError::Timeout {
                        signature: self.signature.clone(),
                        expected: waiter.expected,
                        received: waiter.replies.len(),
                    })
                }
            }
            // Someone else removed it first, and settled it while holding the lock
            None => match self.rx.try_recv() {
                Ok(result) => result,
                Err(_) => Err(StreamError::ConnectionClosed),
            },
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if !self.settled
            && self
                .router
                .remove_if_token(&self.signature, self.token)
                .is_some()
        {
            self.router.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}
