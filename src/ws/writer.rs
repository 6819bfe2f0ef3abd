//! Throttled write path
//!
//! The only way frames reach the transport: take an exclusive lock, take a
//! rate-limiter slot while holding it, then write. A slow write holds back
//! every later slot, so the wire never sees more than the limiter allows.

use crate::ws::rate_limit::RateLimiter;
use crate::ws::transport::{FrameType, Transport};
use crate::{Result, StreamError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct ThrottledWriter<T: Transport> {
    transport: Arc<T>,
    limiter: RateLimiter,
    write_lock: Mutex<()>,
    frames_sent: AtomicU64,
}

impl<T: Transport> ThrottledWriter<T> {
    pub fn new(transport: Arc<T>, limiter: RateLimiter) -> Self {
        Self {
            transport,
            limiter,
            write_lock: Mutex::new(()),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Lock, rate-limit, then write one frame
    ///
    /// # Errors
    /// `Cancelled` if `cancel` fires while waiting for the lock or a slot,
    /// otherwise whatever the transport reports.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        frame_type: FrameType,
        payload: Bytes,
    ) -> Result<()> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            guard = self.write_lock.lock() => guard,
        };

        self.limiter.acquire(cancel).await?;
        self.transport.send_raw(frame_type, payload).await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Frames written since creation
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}
