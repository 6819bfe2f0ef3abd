//! WebSocket transport over tokio-tungstenite
//!
//! The socket is split after the handshake: the reader loop parks on the
//! read half while callers and the keepalive write through the other.
//! Optimized for:
//! - TCP_NODELAY on every socket, proxied or not
//! - No compression
//! - No logging per frame

use crate::ws::transport::{Endpoint, FrameType, Response, Transport};
use crate::{Result, StreamError};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::{
    client_async_tls_with_config, connect_async_with_config, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the close handshake during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Largest proxy CONNECT response head accepted
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// tokio-tungstenite socket behind the [`Transport`] contract
pub struct WebSocketTransport {
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    source: tokio::sync::Mutex<Option<SplitStream<WsStream>>>,
    /// Cancelled by `shutdown`; replaced on every dial
    closed: Mutex<CancellationToken>,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        let closed = CancellationToken::new();
        closed.cancel();
        Self {
            sink: tokio::sync::Mutex::new(None),
            source: tokio::sync::Mutex::new(None),
            closed: Mutex::new(closed),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Handshake timeout (default 10s), proxy tunnel included
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connect(endpoint: &Endpoint) -> Result<WsStream> {
        let (ws, _) = match &endpoint.proxy {
            None => connect_async_with_config(endpoint.url.as_str(), None, true)
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?,
            Some(proxy) => {
                let tunnel = proxy_tunnel(proxy, &endpoint.url).await?;
                client_async_tls_with_config(endpoint.url.as_str(), tunnel, None, None)
                    .await
                    .map_err(|e| StreamError::Transport(e.to_string()))?
            }
        };
        Ok(ws)
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketTransport {
    async fn dial(&self, endpoint: &Endpoint) -> Result<()> {
        let ws = timeout(self.connect_timeout, Self::connect(endpoint))
            .await
            .map_err(|_| {
                StreamError::Transport(format!(
                    "Handshake with {} timed out after {:?}",
                    endpoint.url, self.connect_timeout
                ))
            })??;

        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        *self.closed.lock() = CancellationToken::new();

        debug!(target: "ws", url = %endpoint.url, "Handshake complete");
        Ok(())
    }

    async fn read_message(&self) -> Result<Response> {
        let closed = self.closed.lock().clone();
        let mut source = self.source.lock().await;

        loop {
            let stream = source.as_mut().ok_or(StreamError::ConnectionClosed)?;
            let next = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    *source = None;
                    return Err(StreamError::ConnectionClosed);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    if let Some(frame) = into_response(message) {
                        return Ok(frame);
                    }
                }
                Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                None => return Err(StreamError::ConnectionClosed),
            }
        }
    }

    async fn send_raw(&self, frame_type: FrameType, payload: Bytes) -> Result<()> {
        let message = into_message(frame_type, payload)?;
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(StreamError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.lock().cancel();

        // A write stuck on a dead socket must not hold shutdown hostage
        let sink = match timeout(CLOSE_TIMEOUT, self.sink.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut sink) = sink {
            let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
        Ok(())
    }
}

fn into_response(message: Message) -> Option<Response> {
    let frame_type = match &message {
        Message::Text(_) => FrameType::Text,
        Message::Binary(_) => FrameType::Binary,
        Message::Ping(_) => FrameType::Ping,
        Message::Pong(_) => FrameType::Pong,
        Message::Close(_) => FrameType::Close,
        Message::Frame(_) => return None,
    };
    Some(Response::new(frame_type, message.into_data()))
}

fn into_message(frame_type: FrameType, payload: Bytes) -> Result<Message> {
    Ok(match frame_type {
        FrameType::Text => Message::Text(Utf8Bytes::try_from(payload).map_err(|_| {
            StreamError::InvalidRequest("text frame payload is not valid UTF-8".to_string())
        })?),
        FrameType::Binary => Message::Binary(payload),
        FrameType::Ping => Message::Ping(payload),
        FrameType::Pong => Message::Pong(payload),
        FrameType::Close => Message::Close(None),
    })
}

/// Open a TCP tunnel to the target's host through an HTTP CONNECT proxy
async fn proxy_tunnel(proxy: &str, target: &str) -> Result<TcpStream> {
    let proxy_url =
        url::Url::parse(proxy).map_err(|e| StreamError::InvalidUrl(format!("{}: {}", proxy, e)))?;
    let proxy_host = proxy_url
        .host_str()
        .ok_or_else(|| StreamError::InvalidUrl(format!("{}: missing host", proxy)))?;
    let proxy_port = proxy_url.port_or_known_default().unwrap_or(80);

    let target_url =
        url::Url::parse(target).map_err(|e| StreamError::InvalidUrl(format!("{}: {}", target, e)))?;
    let host = target_url
        .host_str()
        .ok_or_else(|| StreamError::InvalidUrl(format!("{}: missing host", target)))?;
    let port = target_url
        .port_or_known_default()
        .ok_or_else(|| StreamError::InvalidUrl(format!("{}: missing port", target)))?;
    let authority = format!("{}:{}", host, port);

    let mut tcp = TcpStream::connect((proxy_host, proxy_port)).await?;
    tcp.set_nodelay(true)?;
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    tcp.write_all(request.as_bytes()).await?;

    // Byte at a time so nothing past the response head is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(StreamError::Transport("Proxy response head too large".to_string()));
        }
        if tcp.read(&mut byte).await? == 0 {
            return Err(StreamError::Transport(
                "Proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => {
            debug!(target: "ws", proxy = %proxy, %authority, "Proxy tunnel established");
            Ok(tcp)
        }
        _ => Err(StreamError::Transport(format!(
            "Proxy refused CONNECT to {}: {}",
            authority, status_line
        ))),
    }
}
