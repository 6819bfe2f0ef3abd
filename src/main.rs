//! Streaming client
//!
//! Dials the configured exchange stream, subscribes to the streams named on
//! the command line (default `btcusdt@markPrice`) with a correlated request,
//! then drains the feed until Ctrl-C.
//!
//! # Architecture
//! - **ws**: connection core (router, rate limiter, keepalive, transport)
//! - **core**: feed record types
//! - **infrastructure**: cold path (config, logging, latency metrics)

use anyhow::Context;
use hft_stream::infrastructure::logging::init_logging;
use hft_stream::infrastructure::metrics::LatencyMetrics;
use hft_stream::ws::{JsonFieldExtractor, WebSocketTransport};
use hft_stream::{log_ws, Config, Response, StreamConnection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Feed frames buffered before the sink starts dropping
const FEED_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let _guards = init_logging(&config.logging).context("Failed to initialize logging")?;

    let mut streams: Vec<String> = std::env::args().skip(1).collect();
    if streams.is_empty() {
        streams.push("btcusdt@markPrice".to_string());
    }

    let metrics = Arc::new(LatencyMetrics::new());
    let (feed_tx, mut feed_rx) = mpsc::channel::<Response>(FEED_CAPACITY);

    let mut builder = StreamConnection::builder(
        Arc::new(WebSocketTransport::new()),
        config.connection_setup(),
    )
    .signature_extractor(JsonFieldExtractor::new("id"))
    .feed_sink(feed_tx)
    .reporter(metrics.clone());
    if let Some(ping) = config.ping_handler() {
        builder = builder.ping_handler(ping);
    }
    let conn = builder.build()?;

    conn.dial().await.context("Failed to dial stream")?;

    let frames = Arc::new(AtomicU64::new(0));
    let feed_frames = frames.clone();
    let feed_task = tokio::spawn(async move {
        while let Some(frame) = feed_rx.recv().await {
            let seen = feed_frames.fetch_add(1, Ordering::Relaxed) + 1;
            if seen % 1000 == 1 {
                tracing::debug!(
                    frames = seen,
                    sample = %String::from_utf8_lossy(&frame.raw),
                    "Feed frame"
                );
            }
        }
    });

    let cancel = CancellationToken::new();
    let id = conn.generate_message_id(false);
    let subscribe = serde_json::json!({
        "method": "SUBSCRIBE",
        "params": &streams,
        "id": id,
    });
    let reply = conn
        .send_and_await_one(&cancel, id, serde_json::to_vec(&subscribe)?)
        .await
        .context("Subscribe request failed")?;
    log_ws!(
        Level::INFO,
        ?streams,
        reply = %String::from_utf8_lossy(&reply),
        "Subscribed"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    cancel.cancel();
    conn.shutdown().await?;
    feed_task.abort();

    let latency = metrics.snapshot();
    let routing = conn.router_stats();
    tracing::info!(
        feed_frames = frames.load(Ordering::Relaxed),
        round_trips = latency.samples,
        mean_latency = ?latency.mean_latency,
        max_latency = ?latency.max_latency,
        dropped_replies = routing.dropped_frames,
        "Session summary"
    );

    Ok(())
}
