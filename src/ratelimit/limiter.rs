//! Sliding window rate limiter.
//!
//! Approximates a true sliding window with two adjacent fixed windows: the
//! previous window's count is weighted by how much of it still overlaps the
//! trailing window, which avoids the burst-at-boundary problem of a plain
//! fixed window.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::rules::RateLimitConfig;
use super::window::{RateLimitResult, WindowState};
use crate::clock::{epoch_seconds, Clock, SystemClock};

/// A per-key sliding window rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks. The
/// whole check for a key runs under one lock, so concurrent requests for the
/// same key never lose increments.
pub struct SlidingWindowRateLimiter<C: Clock = SystemClock> {
    config: RateLimitConfig,
    clock: C,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl SlidingWindowRateLimiter<SystemClock> {
    /// Create a limiter driven by the wall clock.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> SlidingWindowRateLimiter<C> {
    /// Create a limiter driven by the given clock.
    pub fn with_clock(config: RateLimitConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// The rule this limiter enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether a request for `key` is admitted, counting it if so.
    ///
    /// Unknown keys start with empty counters. A rejected request does not
    /// count against the window.
    pub fn is_allowed(&self, key: &str) -> RateLimitResult {
        let now = epoch_seconds(&self.clock.now());
        let window_size = self.config.window_size_seconds();
        let limit = self.config.requests_per_window() as f64;

        let current_window_start =
            (now.floor() as i64).div_euclid(window_size as i64) * window_size as i64;

        let mut windows = self.windows.lock();
        let state = windows.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, window_start = current_window_start, "Tracking new rate limit key");
            WindowState::new(current_window_start)
        });

        // Idle gaps of several windows carry the last count forward as-is.
        if state.window_start < current_window_start {
            *state = state.roll_over(current_window_start);
        }

        let weighted_count = state.weighted_count(now, window_size);

        trace!(
            key = %key,
            weighted_count,
            current_count = state.current_count,
            previous_count = state.previous_count,
            "Checking rate limit"
        );

        if weighted_count >= limit {
            let window_end = state.window_start.saturating_add(window_size as i64) as f64;
            let retry_after = ((window_end - now).ceil() as i64).max(1) as u64;

            debug!(
                key = %key,
                weighted_count,
                retry_after,
                "Rate limit exceeded"
            );

            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after,
                weighted_count,
            };
        }

        state.current_count += 1;

        let remaining = (limit - weighted_count.floor() - 1.0).max(0.0) as u64;

        RateLimitResult {
            allowed: true,
            remaining,
            retry_after: 0,
            weighted_count: weighted_count + 1.0,
        }
    }

    /// Snapshot of the counters tracked for `key`.
    ///
    /// Returns `None` if the key has never been checked.
    pub fn get_state(&self, key: &str) -> Option<WindowState> {
        self.windows.lock().get(key).copied()
    }

    /// Forget `key`. Returns whether it was tracked.
    pub fn reset(&self, key: &str) -> bool {
        self.windows.lock().remove(key).is_some()
    }

    /// Forget every key. Returns how many were tracked.
    pub fn clear_all(&self) -> usize {
        let mut windows = self.windows.lock();
        let count = windows.len();
        windows.clear();
        count
    }

    /// Get the number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}
