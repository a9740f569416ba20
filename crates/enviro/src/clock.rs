//! Startup clock guard.  A Pi without an RTC can boot with a clock behind
//! the newest stored reading; sampling waits until the clock has caught up
//! so no reading is stamped in the past.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::LocalStore;
use crate::reading::now_timestamp;

/// True when `now` is strictly after the newest stored timestamp, or there
/// is none.
pub fn clock_ok(now: OffsetDateTime, last: Option<OffsetDateTime>) -> bool {
    match last {
        Some(last) => now > last,
        None => true,
    }
}

/// Block until the wall clock is past the newest row in `store`.
///
/// A failed or unparseable lookup is logged and treated as a pass.
pub async fn wait_for_clock(store: &LocalStore, interval: Duration) {
    let last = match store.last_timestamp().await {
        Ok(last) => last,
        Err(e) => {
            warn!("clock guard skipped: {e}");
            return;
        }
    };

    wait_until_past(last, interval, now_timestamp).await;
}

async fn wait_until_past(
    last: Option<OffsetDateTime>,
    interval: Duration,
    mut now: impl FnMut() -> OffsetDateTime,
) -> u32 {
    let mut waits = 0;
    loop {
        let current = now();
        if clock_ok(current, last) {
            if waits > 0 {
                info!(waits, "system clock caught up");
            }
            return waits;
        }
        warn!(
            now = %current,
            last = ?last,
            retry_sec = interval.as_secs(),
            "system clock is behind the newest stored reading, waiting"
        );
        waits += 1;
        tokio::time::sleep(interval).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
