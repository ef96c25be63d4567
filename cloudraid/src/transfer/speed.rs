//! Throughput tracking.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Length of the rolling window.
pub const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Rolling-window and since-start throughput of one byte stream.
///
/// Time is always passed in so callers can drive it from a [`crate::clock::Clock`].
#[derive(Debug, Clone, Default)]
pub struct SpeedController {
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
    total_bytes: u64,
    started: Option<Instant>,
}

impl SpeedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock without recording bytes.
    pub fn start(&mut self, now: Instant) {
        self.started.get_or_insert(now);
    }

    /// Record `delta` bytes at `now` and return the windowed speed.
    pub fn record(&mut self, delta: u64, now: Instant) -> u64 {
        self.start(now);
        if delta > 0 {
            self.samples.push_back((now, delta));
            self.window_bytes += delta;
            self.total_bytes += delta;
        }
        self.speed(now)
    }

    /// Bytes per second over the last [`SPEED_WINDOW`].
    pub fn speed(&mut self, now: Instant) -> u64 {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) <= SPEED_WINDOW {
                break;
            }
            self.window_bytes -= bytes;
            self.samples.pop_front();
        }
        let Some(started) = self.started else {
            return 0;
        };
        let span = now
            .saturating_duration_since(started)
            .clamp(Duration::from_secs(1), SPEED_WINDOW);
        per_second(self.window_bytes, span)
    }

    /// Bytes per second since the first sample.
    pub fn mean_speed(&self, now: Instant) -> u64 {
        let Some(started) = self.started else {
            return 0;
        };
        let span = now.saturating_duration_since(started).max(Duration::from_secs(1));
        per_second(self.total_bytes, span)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Forget all history (used when a connection is repurposed).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn per_second(bytes: u64, span: Duration) -> u64 {
    (bytes as u128 * 1000 / span.as_millis().max(1)) as u64
}
