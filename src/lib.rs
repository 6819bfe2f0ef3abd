//! Streaming-connection core for exchange adapters
//!
//! One persistent socket per connection, shared by unsolicited feed traffic
//! and correlated request/response traffic, throttled by a rate limiter and
//! kept alive by an independent ping loop.

pub mod core;
pub mod infrastructure;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use infrastructure::config::Config;
pub use ws::{
    ConnectionBuilder, ConnectionSetup, ConnectionState, FrameType, PingHandler, Response,
    Signature, StreamConnection,
};

use thiserror::Error;

/// Main error type for the streaming core
#[derive(Error, Debug)]
pub enum StreamError {
    /// Dial, read or write failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Correlated wait reached its deadline before all replies arrived
    #[error("Timed out waiting for {signature}: received {received} of {expected} replies")]
    Timeout {
        signature: Signature,
        expected: usize,
        received: usize,
    },

    /// Another caller is already waiting on this signature
    #[error("Duplicate correlation: signature {0} is already pending")]
    DuplicateCorrelation(Signature),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Too many pending requests (limit {0})")]
    TooManyPending(usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// True for failures that leave the connection usable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::Timeout { .. }
                | StreamError::DuplicateCorrelation(_)
                | StreamError::Cancelled
                | StreamError::TooManyPending(_)
                | StreamError::InvalidRequest(_)
                | StreamError::Serialization(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = StreamError::Timeout {
            signature: Signature::Id(7),
            expected: 3,
            received: 2,
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for 7: received 2 of 3 replies"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(StreamError::Cancelled.is_recoverable());
        assert!(StreamError::DuplicateCorrelation(Signature::from("abc")).is_recoverable());
        assert!(!StreamError::ConnectionClosed.is_recoverable());
        assert!(!StreamError::Transport("reset".to_string()).is_recoverable());
    }
}
