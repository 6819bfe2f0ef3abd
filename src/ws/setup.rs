//! Per-connection settings consumed at dial time

use crate::ws::message_id::BespokeIdFn;
use crate::ws::router::RouterOptions;
use crate::{Result, StreamError};
use std::fmt;
use std::time::Duration;

/// Connection setup
#[derive(Clone)]
pub struct ConnectionSetup {
    /// Connection name used in logs and latency reports (usually the exchange)
    pub name: String,
    /// WebSocket URL
    pub url: String,
    /// Optional HTTP proxy URL
    pub proxy: Option<String>,
    /// Connection carries authenticated traffic
    pub authenticated: bool,
    /// Sweep period for expired waiters (zero disables the sweeper)
    pub response_check_timeout: Duration,
    /// Maximum time a correlated request waits for all its replies
    pub response_max_limit: Duration,
    /// Outbound sends per second, pings included (0 = unlimited)
    pub rate_limit: u64,
    /// Sends allowed back-to-back before spacing kicks in
    pub rate_limit_burst: u32,
    /// Maximum concurrent correlated requests (0 = unlimited)
    pub max_pending_requests: usize,
    /// Forward replies nobody waits for to the feed sink instead of dropping
    pub forward_unmatched_replies: bool,
    /// Replaces the default message ID generator
    pub bespoke_generate_message_id: Option<BespokeIdFn>,
}

impl Default for ConnectionSetup {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            url: String::new(),
            proxy: None,
            authenticated: false,
            response_check_timeout: Duration::from_millis(30),
            response_max_limit: Duration::from_secs(7),
            rate_limit: 0,
            rate_limit_burst: 1,
            max_pending_requests: 1024,
            forward_unmatched_replies: false,
            bespoke_generate_message_id: None,
        }
    }
}

impl fmt::Debug for ConnectionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSetup")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("proxy", &self.proxy)
            .field("authenticated", &self.authenticated)
            .field("response_check_timeout", &self.response_check_timeout)
            .field("response_max_limit", &self.response_max_limit)
            .field("rate_limit", &self.rate_limit)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("max_pending_requests", &self.max_pending_requests)
            .field("forward_unmatched_replies", &self.forward_unmatched_replies)
            .field(
                "bespoke_generate_message_id",
                &self.bespoke_generate_message_id.is_some(),
            )
            .finish()
    }
}

impl ConnectionSetup {
    /// Defaults pointed at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// # Errors
    /// `InvalidUrl` for a non-websocket URL or a malformed proxy,
    /// `Config` for a zero response limit
    pub fn validate(&self) -> Result<()> {
        validate_ws_url(&self.url)?;
        if let Some(proxy) = &self.proxy {
            validate_proxy_url(proxy)?;
        }
        if self.response_max_limit.is_zero() {
            return Err(StreamError::Config(
                "response_max_limit must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn router_options(&self) -> RouterOptions {
        RouterOptions {
            forward_unmatched_replies: self.forward_unmatched_replies,
            max_pending_requests: self.max_pending_requests,
        }
    }
}

pub(crate) fn validate_ws_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| StreamError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host_str().is_some() => Ok(()),
        "ws" | "wss" => Err(StreamError::InvalidUrl(format!("{}: missing host", raw))),
        other => Err(StreamError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            raw, other
        ))),
    }
}

pub(crate) fn validate_proxy_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| StreamError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" if parsed.host_str().is_some() => Ok(()),
        other => Err(StreamError::InvalidUrl(format!(
            "{}: proxy must be http://host:port (got scheme {})",
            raw, other
        ))),
    }
}
