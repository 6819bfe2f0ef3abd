//! Centralized file-based logging system
//!
//! Writes logs to files under the configured directory, separated by type:
//! - main/ - everything, JSON lines
//! - error/ - warnings and errors only
//! - ws/ - connection events (target `ws`)

use super::config::LoggingConfig;
use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_TYPES: [&str; 3] = ["main", "error", "ws"];

/// Initialize console plus file logging
///
/// Returns the appender guards; keep them alive for the whole program or
/// buffered lines are lost on exit. `RUST_LOG` wins over `config.filter`.
///
/// # Errors
/// Fails if the log directories can't be created or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> io::Result<Vec<WorkerGuard>> {
    for log_type in LOG_TYPES {
        fs::create_dir_all(config.directory.join(log_type))?;
    }

    let mut guards = Vec::with_capacity(LOG_TYPES.len());

    // Main log - all logs
    let (main_appender, main_guard) = create_appender(&config.directory, "main")?;
    guards.push(main_guard);

    // Error log - ERROR and WARN only
    let (error_appender, error_guard) = create_appender(&config.directory, "error")?;
    guards.push(error_guard);

    // WebSocket log - connection lifecycle, pings, routing
    let (ws_appender, ws_guard) = create_appender(&config.directory, "ws")?;
    guards.push(ws_guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let ws_layer = tracing_subscriber::fmt::layer()
        .with_writer(ws_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() == "ws" || metadata.target().contains("connection")
        }));

    // Console layer for development
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter(&config.filter))
        .with(main_layer)
        .with(error_layer)
        .with(ws_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    tracing::info!(directory = %config.directory.display(), "Logging system initialized");

    Ok(guards)
}

/// `RUST_LOG` if set and valid, else the configured directive, else `info`
fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Create a daily rolling file appender under `dir/name/`
fn create_appender(dir: &Path, name: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .build(dir.join(name))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Log a connection event under the `ws` target
#[macro_export]
macro_rules! log_ws {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "ws", $level, $($arg)+)
    };
}
