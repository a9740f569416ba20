//! The sampling loop: read the sensors every tick and hand the reading to
//! whichever delivery channels are due.
//!
//! ```text
//!            ┌────────────┐  tick   ┌──────────────┐
//!   board ──▶│ SensorReader├───────▶│ channel gates │──▶ mqtt  : [Publisher]
//!            └────────────┘         └──────────────┘──▶ db    : [RemoteStore, LocalStore]
//! ```
//!
//! Each channel has its own `TimeGate`, so publish and insert cadences are
//! independent.  A failing sink never stops the other sinks of its channel,
//! and a failed sensor read only costs that tick.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::gate::TimeGate;
use crate::reading::Reading;
use crate::sensor::{Board, SensorReader};
use crate::sink::Sink;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A gated group of sinks that all receive the same reading.
struct Channel {
    name: &'static str,
    gate: TimeGate,
    sinks: Vec<Box<dyn Sink>>,
}

impl Channel {
    async fn deliver(&mut self, reading: &Reading, now: Instant) {
        for sink in &mut self.sinks {
            match sink.deliver(reading).await {
                Ok(()) => {}
                Err(e) => error!(
                    channel = self.name,
                    sink = sink.name(),
                    "delivery failed: {e}"
                ),
            }
        }
        self.gate.fire(now);
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct SamplingLoop<B> {
    reader: SensorReader<B>,
    start: Instant,
    start_delay: Duration,
    tick: Duration,
    channels: Vec<Channel>,
}

impl<B: Board> SamplingLoop<B> {
    /// `start` anchors both the warm-up delay and every channel's first
    /// period.
    pub fn new(reader: SensorReader<B>, start: Instant, start_delay: Duration, tick: Duration) -> Self {
        Self {
            reader,
            start,
            start_delay,
            tick,
            channels: Vec::new(),
        }
    }

    /// Add a channel delivering to `sinks`, in order, every `period`.  A
    /// channel without sinks is not added.
    pub fn add_channel(&mut self, name: &'static str, period: Duration, sinks: Vec<Box<dyn Sink>>) {
        if sinks.is_empty() {
            info!(channel = name, "no sinks, channel skipped");
            return;
        }
        let gate = TimeGate::new(period, self.start);
        info!(
            channel = name,
            period_sec = gate.period().as_secs_f64(),
            sinks = ?sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "channel added"
        );
        self.channels.push(Channel { name, gate, sinks });
    }

    fn warmed_up(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start) >= self.start_delay
    }

    /// One iteration: read, then deliver to every due channel.
    pub async fn tick(&mut self, now: Instant) {
        let reading = match self.reader.read() {
            Ok(r) => r,
            Err(e) => {
                warn!("sensor read failed: {e}");
                return;
            }
        };

        if !self.warmed_up(now) {
            return;
        }

        for channel in &mut self.channels {
            if channel.gate.is_due(now) {
                channel.deliver(&reading, now).await;
            }
        }
    }

    /// Tick forever at the configured rate.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.tick.as_millis() as u64,
            start_delay_sec = self.start_delay.as_secs(),
            channels = self.channels.len(),
            "sampling loop started"
        );

        loop {
            ticker.tick().await;
            self.tick(Instant::now()).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
