//! Silence detection for the client's inbound traffic

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Fresh,
    /// Nothing has arrived for longer than the threshold
    Stale { silent_for: Duration },
}

/// Tracks when the last inbound message arrived.
///
/// A stale check re-arms the monitor, so one silent period fires at most once
/// per threshold.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    last_message: Instant,
    threshold: Duration,
}

impl LivenessMonitor {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            last_message: now,
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn record_message(&mut self, now: Instant) {
        self.last_message = now;
    }

    pub fn check(&mut self, now: Instant) -> Liveness {
        let silent_for = now.saturating_duration_since(self.last_message);
        if silent_for > self.threshold {
            self.last_message = now;
            Liveness::Stale { silent_for }
        } else {
            Liveness::Fresh
        }
    }
}
