//! Unsolicited feed sink
//!
//! Every frame that is not a reply to a pending request goes here, to be
//! decoded by the exchange adapter into trades, book deltas, funding, klines.

use crate::ws::transport::Response;
use tokio::sync::mpsc;
use tracing::warn;

/// Receiver of unsolicited frames
///
/// Called from the reader loop, so implementations must not block.
pub trait FeedSink: Send + Sync + 'static {
    fn deliver(&self, frame: Response);
}

impl FeedSink for mpsc::UnboundedSender<Response> {
    fn deliver(&self, frame: Response) {
        // Receiver gone means the adapter stopped consuming; nothing to do
        let _ = self.send(frame);
    }
}

impl FeedSink for mpsc::Sender<Response> {
    fn deliver(&self, frame: Response) {
        match self.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    target: "ws",
                    frame_type = %frame.frame_type,
                    len = frame.raw.len(),
                    "Feed sink full, dropping frame"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
