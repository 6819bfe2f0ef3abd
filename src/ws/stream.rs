//! Stream connection
//!
//! Public face of one socket: dial, correlated send-and-wait, fire-and-forget
//! sends, shutdown. Cloning a `StreamConnection` hands out another handle to
//! the same connection, so concurrent callers share one socket, one waiter
//! table and one rate limiter.

use crate::infrastructure::metrics::Reporter;
use crate::ws::feed::FeedSink;
use crate::ws::message_id::MessageIdGenerator;
use crate::ws::ping::{ConnectionHealth, KeepaliveHealth, KeepaliveScheduler, PingHandler};
use crate::ws::rate_limit::RateLimiter;
use crate::ws::router::{ResponseRouter, RouterStats};
use crate::ws::setup::{validate_proxy_url, validate_ws_url, ConnectionSetup};
use crate::ws::signature::{Signature, SignatureExtractor};
use crate::ws::transport::{Endpoint, FrameType, Response, Transport};
use crate::ws::writer::ThrottledWriter;
use crate::{Result, StreamError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for the reader loop to notice the closed socket
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; configuration may change
    Disconnected,
    /// Dial in progress
    Connecting,
    /// Socket up, reader running
    Connected,
}

struct Lifecycle {
    state: ConnectionState,
    /// Bumped on every dial and shutdown so stale tasks can tell they are stale
    generation: u64,
    /// Cancelled when the current session ends
    session: CancellationToken,
    reader: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    /// Held by shutdown and reader teardown for their whole run, and by dial
    /// while it claims the connection, so a dial never lands inside a teardown
    transition: tokio::sync::Mutex<()>,
    setup: RwLock<ConnectionSetup>,
    ping: Mutex<Option<PingHandler>>,
    lifecycle: Mutex<Lifecycle>,
    router: Arc<ResponseRouter>,
    writer: Arc<ThrottledWriter<T>>,
    health: Arc<KeepaliveHealth>,
    ids: MessageIdGenerator,
    reporter: Option<Arc<dyn Reporter>>,
}

/// Builder for [`StreamConnection`]
pub struct ConnectionBuilder<T: Transport> {
    transport: Arc<T>,
    setup: ConnectionSetup,
    extractor: Option<Arc<dyn SignatureExtractor>>,
    sink: Option<Arc<dyn FeedSink>>,
    reporter: Option<Arc<dyn Reporter>>,
    ping: Option<PingHandler>,
}

impl<T: Transport> ConnectionBuilder<T> {
    pub fn new(transport: Arc<T>, setup: ConnectionSetup) -> Self {
        Self {
            transport,
            setup,
            extractor: None,
            sink: None,
            reporter: None,
            ping: None,
        }
    }

    /// How inbound replies are matched to requests (required)
    pub fn signature_extractor(mut self, extractor: impl SignatureExtractor) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    /// Where unsolicited frames go (required)
    pub fn feed_sink(mut self, sink: impl FeedSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn ping_handler(mut self, handler: PingHandler) -> Self {
        self.ping = Some(handler);
        self
    }

    /// # Errors
    /// `Config` when the extractor or sink is missing or the ping handler is
    /// invalid, `InvalidUrl` for bad URLs
    pub fn build(self) -> Result<StreamConnection<T>> {
        self.setup.validate()?;
        if let Some(ping) = &self.ping {
            ping.validate()?;
        }
        let extractor = self
            .extractor
            .ok_or_else(|| StreamError::Config("signature extractor is required".to_string()))?;
        let sink = self
            .sink
            .ok_or_else(|| StreamError::Config("feed sink is required".to_string()))?;

        let router = Arc::new(ResponseRouter::new(
            extractor,
            sink,
            self.setup.router_options(),
        ));
        let limiter = RateLimiter::new(self.setup.rate_limit, self.setup.rate_limit_burst);
        let writer = Arc::new(ThrottledWriter::new(self.transport.clone(), limiter));
        let ids = MessageIdGenerator::from_override(self.setup.bespoke_generate_message_id.clone());

        let session = CancellationToken::new();
        session.cancel();

        Ok(StreamConnection {
            shared: Arc::new(Shared {
                transport: self.transport,
                transition: tokio::sync::Mutex::new(()),
                setup: RwLock::new(self.setup),
                ping: Mutex::new(self.ping),
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    session,
                    reader: None,
                    background: Vec::new(),
                }),
                router,
                writer,
                health: Arc::new(KeepaliveHealth::new()),
                ids,
                reporter: self.reporter,
            }),
        })
    }
}

/// One streaming connection
pub struct StreamConnection<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for StreamConnection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> StreamConnection<T> {
    pub fn builder(transport: Arc<T>, setup: ConnectionSetup) -> ConnectionBuilder<T> {
        ConnectionBuilder::new(transport, setup)
    }

    /// Establish the socket and start the reader, sweeper and keepalive tasks
    ///
    /// # Errors
    /// `AlreadyConnected` unless disconnected; the transport's error on a
    /// failed handshake (the connection stays disconnected, retry is safe);
    /// `ConnectionClosed` if `shutdown` ran while dialing.
    pub async fn dial(&self) -> Result<()> {
        let gate = self.shared.transition.lock().await;
        let (endpoint, generation, name) = {
            let mut life = self.shared.lifecycle.lock();
            if life.state != ConnectionState::Disconnected {
                return Err(StreamError::AlreadyConnected);
            }
            life.state = ConnectionState::Connecting;
            life.generation += 1;

            let setup = self.shared.setup.read();
            let endpoint = Endpoint {
                url: setup.url.clone(),
                proxy: setup.proxy.clone(),
            };
            (endpoint, life.generation, setup.name.clone())
        };
        drop(gate);

        info!(target: "ws", %name, url = %endpoint.url, proxied = endpoint.proxy.is_some(), "Dialing");

        if let Err(e) = self.shared.transport.dial(&endpoint).await {
            let mut life = self.shared.lifecycle.lock();
            if life.generation == generation {
                life.state = ConnectionState::Disconnected;
            }
            warn!(target: "ws", %name, error = %e, "Dial failed");
            return Err(e);
        }

        let session = CancellationToken::new();
        let superseded = {
            let mut life = self.shared.lifecycle.lock();
            if life.generation != generation || life.state != ConnectionState::Connecting {
                Some(life.state)
            } else {
                self.shared.router.reopen();
                self.shared.health.reset();
                life.state = ConnectionState::Connected;
                life.session = session.clone();
                life.reader = Some(self.spawn_reader(generation, session.clone()));
                life.background = self.spawn_background(&session, &name);
                None
            }
        };

        if let Some(current) = superseded {
            // Shutdown won the race; only close the socket if nobody redialed since
            if current == ConnectionState::Disconnected {
                let _ = self.shared.transport.shutdown().await;
            }
            return Err(StreamError::ConnectionClosed);
        }

        info!(target: "ws", %name, "Connected");
        Ok(())
    }

    fn spawn_reader(&self, generation: u64, session: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let health = Arc::clone(&shared.health);
            let error = Arc::clone(&shared.router)
                .run_reader(Arc::clone(&shared.transport), move |_: &Response| {
                    health.record_activity()
                })
                .await;
            shared.on_reader_exit(generation, session, error).await;
        })
    }

    fn spawn_background(&self, session: &CancellationToken, name: &str) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let sweep_period = self.shared.setup.read().response_check_timeout;
        if !sweep_period.is_zero() {
            let router = Arc::clone(&self.shared.router);
            tasks.push(tokio::spawn(router.run_sweeper(sweep_period, session.clone())));
        }

        if let Some(handler) = self.shared.ping.lock().clone() {
            let scheduler = KeepaliveScheduler::new(
                handler,
                Arc::clone(&self.shared.writer),
                Arc::clone(&self.shared.health),
                self.shared.reporter.clone(),
                name,
            );
            tasks.push(tokio::spawn(scheduler.run(session.clone())));
        }

        tasks
    }

    /// Token of the live session, or `NotConnected`
    fn session(&self) -> Result<CancellationToken> {
        let life = self.shared.lifecycle.lock();
        if life.state != ConnectionState::Connected {
            return Err(StreamError::NotConnected);
        }
        Ok(life.session.clone())
    }

    /// Throttled write racing the session; session end reads as `ConnectionClosed`
    async fn write(
        &self,
        session: &CancellationToken,
        cancel: &CancellationToken,
        frame_type: FrameType,
        payload: Bytes,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = session.cancelled() => Err(StreamError::ConnectionClosed),
            result = self.shared.writer.send(cancel, frame_type, payload) => result,
        }
    }

    /// Send `payload` and wait for `expected` replies carrying `signature`
    ///
    /// The waiter is registered before the request goes out. The deadline
    /// (`response_max_limit`) covers the rate-limit wait, the write and the
    /// replies.
    ///
    /// # Errors
    /// `NotConnected`, `DuplicateCorrelation`, `TooManyPending`,
    /// `InvalidRequest`, `Timeout`, `Cancelled`, `ConnectionClosed`, or the
    /// transport's write error.
    pub async fn send_request(
        &self,
        cancel: &CancellationToken,
        frame_type: FrameType,
        signature: Signature,
        payload: Bytes,
        expected: usize,
    ) -> Result<Vec<Bytes>> {
        let session = self.session()?;
        let timeout = self.shared.setup.read().response_max_limit;
        let handle = self.shared.router.wait_for(signature, expected, timeout)?;
        let deadline = handle.deadline();
        // Round trip as the caller sees it, rate-limit wait included
        let start = Instant::now();

        match tokio::time::timeout_at(
            deadline,
            self.write(&session, cancel, frame_type, payload.clone()),
        )
        .await
        {
            Ok(Ok(())) => {}
            // Dropping the handle takes the waiter out of the table
            Ok(Err(e)) => return Err(e),
            // Deadline hit before the write finished
            Err(_) => return handle.expire(),
        }

        let replies = handle.wait(cancel).await?;

        if let Some(reporter) = &self.shared.reporter {
            let name = self.shared.setup.read().name.clone();
            reporter.latency(&name, &payload, start.elapsed());
        }
        Ok(replies)
    }

    /// Send a text request and wait for exactly one reply
    pub async fn send_and_await_one(
        &self,
        cancel: &CancellationToken,
        signature: impl Into<Signature>,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes> {
        let replies = self
            .send_request(cancel, FrameType::Text, signature.into(), payload.into(), 1)
            .await?;
        replies
            .into_iter()
            .next()
            .ok_or(StreamError::ConnectionClosed)
    }

    /// Send a text request and wait for `expected` replies (paginated or
    /// chunked acknowledgements), returned in arrival order
    pub async fn send_and_await_many(
        &self,
        cancel: &CancellationToken,
        signature: impl Into<Signature>,
        payload: impl Into<Bytes>,
        expected: usize,
    ) -> Result<Vec<Bytes>> {
        self.send_request(
            cancel,
            FrameType::Text,
            signature.into(),
            payload.into(),
            expected,
        )
        .await
    }

    /// Fire-and-forget write, still rate-limited
    ///
    /// # Errors
    /// `NotConnected`, `ConnectionClosed` if shutdown interrupts the wait for
    /// a slot, or the transport's write error.
    pub async fn send_raw(&self, frame_type: FrameType, payload: impl Into<Bytes>) -> Result<()> {
        let session = self.session()?;
        match self.write(&session, &session, frame_type, payload.into()).await {
            Err(StreamError::Cancelled) => Err(StreamError::ConnectionClosed),
            other => other,
        }
    }

    /// Serialize `value` as JSON and send it as a text frame
    pub async fn send_json_message<V: Serialize + ?Sized>(&self, value: &V) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send_raw(FrameType::Text, payload).await
    }

    /// Close the connection
    ///
    /// Idempotent and safe to race with any other call. Every pending wait
    /// fails with `ConnectionClosed`; the reader stops once the transport
    /// read returns. A dial issued meanwhile waits until teardown is done.
    pub async fn shutdown(&self) -> Result<()> {
        let _gate = self.shared.transition.lock().await;
        let (session, reader, background, failed) = {
            let mut life = self.shared.lifecycle.lock();
            if life.state == ConnectionState::Disconnected {
                return Ok(());
            }
            life.state = ConnectionState::Disconnected;
            life.generation += 1;
            (
                life.session.clone(),
                life.reader.take(),
                std::mem::take(&mut life.background),
                self.shared.router.close_all(),
            )
        };

        session.cancel();
        for task in background {
            task.abort();
        }
        let result = self.shared.transport.shutdown().await;

        if let Some(mut reader) = reader {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                warn!(target: "ws", "Reader did not stop after transport shutdown, aborting");
                reader.abort();
            }
        }

        info!(target: "ws", name = %self.name(), failed_waiters = failed, "Connection shut down");
        result
    }

    /// Next message ID from this connection's generator
    pub fn generate_message_id(&self, high_precision: bool) -> i64 {
        self.shared.ids.next(high_precision)
    }

    /// Install the keepalive settings used by the next dial
    ///
    /// # Errors
    /// `AlreadyConnected` unless disconnected, `Config` for invalid settings
    pub fn setup_ping_handler(&self, handler: PingHandler) -> Result<()> {
        handler.validate()?;
        let life = self.shared.lifecycle.lock();
        if life.state != ConnectionState::Disconnected {
            return Err(StreamError::AlreadyConnected);
        }
        *self.shared.ping.lock() = Some(handler);
        Ok(())
    }

    pub fn ping_handler(&self) -> Option<PingHandler> {
        self.shared.ping.lock().clone()
    }

    pub fn url(&self) -> String {
        self.shared.setup.read().url.clone()
    }

    /// # Errors
    /// `AlreadyConnected` unless disconnected, `InvalidUrl` for a bad URL
    pub fn set_url(&self, url: impl Into<String>) -> Result<()> {
        let url = url.into();
        validate_ws_url(&url)?;
        let life = self.shared.lifecycle.lock();
        if life.state != ConnectionState::Disconnected {
            return Err(StreamError::AlreadyConnected);
        }
        self.shared.setup.write().url = url;
        Ok(())
    }

    pub fn proxy(&self) -> Option<String> {
        self.shared.setup.read().proxy.clone()
    }

    /// Set or clear (`None`) the proxy for the next dial
    ///
    /// # Errors
    /// `AlreadyConnected` unless disconnected, `InvalidUrl` for a bad proxy URL
    pub fn set_proxy(&self, proxy: Option<String>) -> Result<()> {
        if let Some(proxy) = &proxy {
            validate_proxy_url(proxy)?;
        }
        let life = self.shared.lifecycle.lock();
        if life.state != ConnectionState::Disconnected {
            return Err(StreamError::AlreadyConnected);
        }
        self.shared.setup.write().proxy = proxy;
        Ok(())
    }

    pub fn name(&self) -> String {
        self.shared.setup.read().name.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.setup.read().authenticated
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Correlated requests currently waiting
    pub fn pending_requests(&self) -> usize {
        self.shared.router.pending()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.shared.router.stats()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.shared.health.snapshot()
    }

    /// Frames written since creation, pings included
    pub fn frames_sent(&self) -> u64 {
        self.shared.writer.frames_sent()
    }
}

impl<T: Transport> Shared<T> {
    /// Reader stopped: if this session is still current the remote side (or
    /// the network) closed it, so mark the connection down
    async fn on_reader_exit(
        &self,
        generation: u64,
        session: CancellationToken,
        error: StreamError,
    ) {
        // A running shutdown holds the gate and is joining this task
        let _gate = tokio::select! {
            biased;
            _ = session.cancelled() => {
                debug!(target: "ws", error = %error, "Reader stopped after shutdown");
                return;
            }
            gate = self.transition.lock() => gate,
        };

        {
            let mut life = self.lifecycle.lock();
            if life.generation != generation || life.state != ConnectionState::Connected {
                debug!(target: "ws", error = %error, "Reader stopped after shutdown");
                return;
            }
            life.state = ConnectionState::Disconnected;
            life.generation += 1;
            life.reader = None;
            for task in std::mem::take(&mut life.background) {
                task.abort();
            }
        }

        session.cancel();
        let name = self.setup.read().name.clone();
        match error {
            StreamError::ConnectionClosed => warn!(target: "ws", %name, "Connection closed by peer"),
            error => error!(target: "ws", %name, %error, "Connection lost"),
        }
        let _ = self.transport.shutdown().await;
    }
}
