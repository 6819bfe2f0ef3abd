//! Transport contract
//!
//! The socket itself lives outside the core. Anything that can dial, read one
//! frame at a time, write raw bytes and shut down can carry a connection.

use crate::Result;
use bytes::Bytes;
use std::fmt;
use std::future::Future;

/// Frame type of a raw message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl FrameType {
    /// Control frames carry protocol housekeeping, not application data
    #[inline]
    pub const fn is_control(&self) -> bool {
        matches!(self, FrameType::Ping | FrameType::Pong | FrameType::Close)
    }

    /// Parse a frame type name as written in configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" => Some(FrameType::Text),
            "binary" => Some(FrameType::Binary),
            "ping" => Some(FrameType::Ping),
            "pong" => Some(FrameType::Pong),
            "close" => Some(FrameType::Close),
            _ => None,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Text => "text",
            FrameType::Binary => "binary",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Close => "close",
        };
        f.write_str(name)
    }
}

/// One raw frame as delivered by the transport
///
/// Never mutated after creation; `raw` clones are reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub frame_type: FrameType,
    pub raw: Bytes,
}

impl Response {
    pub fn new(frame_type: FrameType, raw: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            raw: raw.into(),
        }
    }

    /// Text frame helper
    pub fn text(raw: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Text, raw)
    }

    /// Binary frame helper
    pub fn binary(raw: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Binary, raw)
    }
}

/// Where to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// Optional HTTP proxy (`http://host:port`)
    pub proxy: Option<String>,
}

/// Physical socket contract
///
/// All methods take `&self`: the reader loop, callers and the keepalive loop
/// use the same transport concurrently. Implementations keep their read and
/// write halves independent so a blocked read never stalls a write.
pub trait Transport: Send + Sync + 'static {
    /// Establish the socket. Safe to call again after a failed attempt or
    /// after `shutdown`.
    fn dial(&self, endpoint: &Endpoint) -> impl Future<Output = Result<()>> + Send;

    /// Block until one frame arrives. Returns `Err(StreamError::ConnectionClosed)`
    /// (or a transport error) once the socket is gone; the reader loop stops there.
    fn read_message(&self) -> impl Future<Output = Result<Response>> + Send;

    /// Write one frame.
    fn send_raw(&self, frame_type: FrameType, payload: Bytes)
        -> impl Future<Output = Result<()>> + Send;

    /// Close the socket. Idempotent; unblocks any in-flight `read_message`.
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send;
}
