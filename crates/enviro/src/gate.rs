//! Elapsed-time gates deciding when a delivery channel fires.

use std::time::Duration;
use tokio::time::Instant;

/// True once at least `period` has passed since `last`.
///
/// A `now` earlier than `last` counts as zero elapsed time.
pub fn is_due(now: Instant, last: Instant, period: Duration) -> bool {
    now.saturating_duration_since(last) >= period
}

/// Period plus the instant of the last delivery attempt.
#[derive(Debug, Clone, Copy)]
pub struct TimeGate {
    period: Duration,
    last: Instant,
}

impl TimeGate {
    /// The first delivery is due one full period after `start`.
    pub fn new(period: Duration, start: Instant) -> Self {
        Self {
            period,
            last: start,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_due(&self, now: Instant) -> bool {
        is_due(now, self.last, self.period)
    }

    /// Record a delivery at `now`.  The next one is measured from here, not
    /// from when this one was scheduled, so lateness carries forward.
    pub fn fire(&mut self, now: Instant) {
        self.last = now;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
