//! Per-key window state and the result of a rate limit check.

use serde::Serialize;

/// Counters for one rate-limited key.
///
/// `window_start` is aligned to a multiple of the window size. When time
/// crosses into a later window the state is replaced, carrying
/// `current_count` over as `previous_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowState {
    /// Start of the current window, epoch seconds.
    pub window_start: i64,
    /// Requests admitted in the current window.
    pub current_count: u64,
    /// Requests admitted in the window before it.
    pub previous_count: u64,
}

impl WindowState {
    /// A fresh window with no admitted requests.
    pub fn new(window_start: i64) -> Self {
        Self {
            window_start,
            current_count: 0,
            previous_count: 0,
        }
    }

    /// Start a new window at `window_start`, carrying this window's count.
    pub fn roll_over(&self, window_start: i64) -> Self {
        Self {
            window_start,
            current_count: 0,
            previous_count: self.current_count,
        }
    }

    /// Interpolated request count at `now` (epoch seconds).
    pub fn weighted_count(&self, now: f64, window_size: u64) -> f64 {
        let window_size = window_size as f64;
        let elapsed = now - self.window_start as f64;

        if elapsed >= window_size {
            self.current_count as f64
        } else {
            self.previous_count as f64 * (1.0 - elapsed / window_size) + self.current_count as f64
        }
    }
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// Seconds to wait before retrying, zero when admitted
    pub retry_after: u64,
    /// Weighted count, including this request when admitted
    pub weighted_count: f64,
}
