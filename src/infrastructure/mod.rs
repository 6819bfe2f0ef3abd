//! Infrastructure - cold path only
//!
//! This module contains non-latency-critical code:
//! - Configuration management
//! - Logging
//! - Latency reporters

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError};
pub use metrics::{ChannelReporter, LatencyMetrics, LatencySample, Reporter};
