//! Message ID generation
//!
//! Default IDs come from the wall clock (milliseconds, or microseconds for
//! high precision) pushed forward whenever the clock has not moved, so one
//! generator never hands out the same value twice.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Caller-supplied generator, e.g. for exchanges that need structured
/// sequence numbers. Receives the `high_precision` flag.
pub type BespokeIdFn = Arc<dyn Fn(bool) -> i64 + Send + Sync>;

/// Per-connection message ID generator
pub struct MessageIdGenerator {
    /// Last value handed out by the clock sequence
    last: AtomicI64,
    /// Overrides the clock sequence entirely when set
    bespoke: Option<BespokeIdFn>,
}

impl MessageIdGenerator {
    /// Clock-sequence generator
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
            bespoke: None,
        }
    }

    /// Generator routing every call to `f`
    pub fn bespoke(f: BespokeIdFn) -> Self {
        Self {
            last: AtomicI64::new(0),
            bespoke: Some(f),
        }
    }

    pub(crate) fn from_override(f: Option<BespokeIdFn>) -> Self {
        match f {
            Some(f) => Self::bespoke(f),
            None => Self::new(),
        }
    }

    /// Is a bespoke function installed
    pub fn is_bespoke(&self) -> bool {
        self.bespoke.is_some()
    }

    /// Next message ID
    ///
    /// `high_precision` reads the clock at microsecond resolution instead of
    /// milliseconds, for exchanges that reject IDs repeating within the same
    /// millisecond across sessions.
    pub fn next(&self, high_precision: bool) -> i64 {
        if let Some(f) = &self.bespoke {
            return f(high_precision);
        }

        let candidate = clock_value(high_precision);
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageIdGenerator")
            .field("last", &self.last.load(Ordering::Relaxed))
            .field("bespoke", &self.bespoke.is_some())
            .finish()
    }
}

fn clock_value(high_precision: bool) -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let value = if high_precision {
        since_epoch.as_micros()
    } else {
        since_epoch.as_millis()
    };
    i64::try_from(value).unwrap_or(i64::MAX)
}
