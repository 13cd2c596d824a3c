use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Maximum number of job starts per rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Starts admitted per window
    pub max: u32,
    /// Window length in milliseconds
    pub duration_ms: u64,
}

impl RateLimit {
    /// Admit at most `max` starts in any window of `duration`.
    pub fn new(max: u32, duration: Duration) -> Self {
        Self {
            max,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The window length.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Sliding-log limiter: remembers the start time of every admitted job
/// inside the current window.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    limit: RateLimit,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            starts: VecDeque::with_capacity(limit.max as usize),
        }
    }

    /// How long to wait before another start is admitted. Zero means now.
    pub(crate) fn time_until_available(&mut self, now: Instant) -> Duration {
        let window = self.limit.duration();
        while let Some(&oldest) = self.starts.front() {
            if now.duration_since(oldest) >= window {
                self.starts.pop_front();
            } else {
                break;
            }
        }

        if self.starts.len() < self.limit.max as usize {
            return Duration::ZERO;
        }

        // Full: the oldest start has to leave the window first.
        self.starts
            .front()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Record an admitted start.
    pub(crate) fn record(&mut self, now: Instant) {
        self.starts.push_back(now);
    }
}
