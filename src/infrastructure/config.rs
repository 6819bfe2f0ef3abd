//! Configuration management
//!
//! Loads configuration from config.toml (or `CONFIG_PATH`) at startup.
//! Every field has a default so a partial file, or none at all, works.

use crate::ws::{ConnectionSetup, FrameType, PingHandler};
use crate::StreamError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[connection]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_url")]
    pub url: String,

    /// HTTP CONNECT proxy, e.g. `http://10.0.0.1:3128`
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub authenticated: bool,

    /// Waiter sweep period; 0 disables the sweeper
    #[serde(default = "default_response_check_timeout_ms")]
    pub response_check_timeout_ms: u64,

    #[serde(default = "default_response_max_limit_ms")]
    pub response_max_limit_ms: u64,

    /// Outbound frames per second, pings included; 0 = unlimited
    #[serde(default)]
    pub rate_limit: u64,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,

    #[serde(default)]
    pub forward_unmatched_replies: bool,
}

/// `[keepalive]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Protocol ping frames instead of an application message
    #[serde(default = "default_true")]
    pub native: bool,

    /// `text` or `binary`, for application-level pings
    #[serde(default = "default_message_type")]
    pub message_type: String,

    #[serde(default)]
    pub message: String,

    #[serde(default = "default_ping_delay_ms")]
    pub delay_ms: u64,
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            url: default_url(),
            proxy: None,
            authenticated: false,
            response_check_timeout_ms: default_response_check_timeout_ms(),
            response_max_limit_ms: default_response_max_limit_ms(),
            rate_limit: 0,
            rate_limit_burst: default_rate_limit_burst(),
            max_pending_requests: default_max_pending_requests(),
            forward_unmatched_replies: false,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            native: true,
            message_type: default_message_type(),
            message: String::new(),
            delay_ms: default_ping_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            directory: default_log_directory(),
        }
    }
}

fn default_name() -> String {
    "binance".to_string()
}

fn default_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_response_check_timeout_ms() -> u64 {
    30
}

fn default_response_max_limit_ms() -> u64 {
    7_000
}

fn default_rate_limit_burst() -> u32 {
    1
}

fn default_max_pending_requests() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_message_type() -> String {
    "text".to_string()
}

fn default_ping_delay_ms() -> u64 {
    30_000
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

impl Config {
    /// Load configuration from `CONFIG_PATH` (default `config.toml`)
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if the file exists but cannot be read, parsed or validated.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(config_path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde can't express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection_setup()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.keepalive.enabled {
            if !self.keepalive.native && self.ping_frame_type().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "keepalive.message_type must be text or binary, got {}",
                    self.keepalive.message_type
                )));
            }
            if let Some(handler) = self.ping_handler() {
                handler
                    .validate()
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Connection settings for the builder
    pub fn connection_setup(&self) -> ConnectionSetup {
        let c = &self.connection;
        ConnectionSetup {
            name: c.name.clone(),
            url: c.url.clone(),
            proxy: c.proxy.clone(),
            authenticated: c.authenticated,
            response_check_timeout: Duration::from_millis(c.response_check_timeout_ms),
            response_max_limit: Duration::from_millis(c.response_max_limit_ms),
            rate_limit: c.rate_limit,
            rate_limit_burst: c.rate_limit_burst,
            max_pending_requests: c.max_pending_requests,
            forward_unmatched_replies: c.forward_unmatched_replies,
            bespoke_generate_message_id: None,
        }
    }

    /// Keepalive settings, `None` when disabled
    pub fn ping_handler(&self) -> Option<PingHandler> {
        let k = &self.keepalive;
        if !k.enabled {
            return None;
        }

        let delay = Duration::from_millis(k.delay_ms);
        if k.native {
            return Some(PingHandler::native(delay));
        }
        let message_type = self.ping_frame_type().unwrap_or(FrameType::Text);
        Some(PingHandler::message(
            message_type,
            k.message.clone().into_bytes(),
            delay,
        ))
    }

    fn ping_frame_type(&self) -> Option<FrameType> {
        FrameType::from_name(&self.keepalive.message_type)
            .filter(|t| matches!(t, FrameType::Text | FrameType::Binary))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for StreamError {
    fn from(e: ConfigError) -> Self {
        StreamError::Config(e.to_string())
    }
}
