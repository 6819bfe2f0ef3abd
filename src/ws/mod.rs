//! Persistent streaming connections
//!
//! One socket per [`StreamConnection`]: correlated request/response over a
//! single reader loop, unsolicited frames to a feed sink, rate-limited
//! writes, keepalive pings.

pub mod connection;
pub mod feed;
pub mod message_id;
pub mod ping;
pub mod rate_limit;
pub mod router;
pub mod setup;
pub mod signature;
pub mod stream;
pub mod transport;
pub mod writer;

pub use connection::WebSocketTransport;
pub use feed::FeedSink;
pub use message_id::{BespokeIdFn, MessageIdGenerator};
pub use ping::{ConnectionHealth, KeepaliveHealth, KeepaliveScheduler, PingHandler};
pub use rate_limit::RateLimiter;
pub use router::{ResponseRouter, Routed, RouterOptions, RouterStats, WaitHandle};
pub use setup::ConnectionSetup;
pub use signature::{JsonFieldExtractor, Signature, SignatureExtractor};
pub use stream::{ConnectionBuilder, ConnectionState, StreamConnection};
pub use transport::{Endpoint, FrameType, Response, Transport};
pub use writer::ThrottledWriter;
