//! Time-throttled progress reporting.
//!
//! The download loop sees every chunk; observers only see an update when at
//! least `interval` has passed since the last one they were shown, plus one
//! forced final report at completion.

use std::time::{Duration, Instant};

/// Observer callback: `(bytes_received, total_bytes)`.
pub type ProgressCallback<'a> = dyn FnMut(u64, Option<u64>) + Send + 'a;

/// Decides which progress samples reach an observer.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns `true` if a sample taken at `now` should be forwarded.
    ///
    /// The first sample is always forwarded.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    /// Record a forced emission (the final 100% report).
    pub fn force(&mut self, now: Instant) {
        self.last_emit = Some(now);
    }
}

/// Whole-number percentage, or `None` when the total is unknown.
pub fn percent(received: u64, total: Option<u64>) -> Option<u8> {
    match total {
        Some(0) | None => None,
        Some(total) => {
            let pct = received.saturating_mul(100) / total;
            Some(pct.min(100) as u8)
        }
    }
}
