//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Length of the sliding window
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Named rate limit preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
        }
    }
}

/// Request timestamps for one service over the last window.
///
/// The limit is supplied per check, so calls using different presets
/// against the same service share one window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    requests: VecDeque<Instant>,
    rejected: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(RATE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            requests: VecDeque::new(),
            rejected: 0,
        }
    }

    /// Admit a request iff fewer than `limit` were admitted in the window
    pub fn try_admit(&mut self, limit: u32) -> bool {
        let now = Instant::now();
        self.evict(now);

        if self.requests.len() >= limit as usize {
            self.rejected += 1;
            return false;
        }

        self.requests.push_back(now);
        true
    }

    /// Requests admitted in the current window
    pub fn current(&mut self) -> usize {
        self.evict(Instant::now());
        self.requests.len()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}
