//! Rate limit rules and their textual form.
//!
//! A rule is written as `"<requests>/<unit>"`, for example `"100/minute"` or
//! `"10/seconds"`. Parsing happens at startup so a malformed rule fails the
//! owning component before it serves any traffic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{GatekeeperError, Result};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of this unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }


    /// Parse a unit name, singular or plural, ignoring case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "second" | "seconds" => Some(TimeUnit::Second),
            "minute" | "minutes" => Some(TimeUnit::Minute),
            "hour" | "hours" => Some(TimeUnit::Hour),
            "day" | "days" => Some(TimeUnit::Day),
            _ => None,
        }
    }

    /// Find the unit whose length is exactly `seconds`.
    pub fn from_seconds(seconds: u64) -> Option<Self> {
        [TimeUnit::Second, TimeUnit::Minute, TimeUnit::Hour, TimeUnit::Day]
            .into_iter()
            .find(|unit| unit.seconds() == seconds)
    }

    fn name(&self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
        }
    }
}

/// How many requests a key may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimitConfig {
    requests_per_window: u32,
    window_size_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_size_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    /// Create a validated rule. Both values must be positive and the window
    /// must fit in signed epoch seconds.
    pub fn new(requests_per_window: u32, window_size_seconds: u64) -> Result<Self> {
        if requests_per_window == 0 {
            return Err(GatekeeperError::Config(
                "requests_per_window must be greater than zero".to_string(),
            ));
        }
        if window_size_seconds == 0 {
            return Err(GatekeeperError::Config(
                "window_size_seconds must be greater than zero".to_string(),
            ));
        }
        // Window boundaries are computed in signed epoch seconds.
        if window_size_seconds > i64::MAX as u64 {
            return Err(GatekeeperError::Config(format!(
                "window_size_seconds must not exceed {}",
                i64::MAX
            )));
        }
        Ok(Self {
            requests_per_window,
            window_size_seconds,
        })
    }

    /// Create a rule of `requests` per one `unit`.
    pub fn per(requests: u32, unit: TimeUnit) -> Result<Self> {
        Self::new(requests, unit.seconds())
    }

    /// Maximum requests admitted per window.
    pub fn requests_per_window(&self) -> u32 {
        self.requests_per_window
    }

    /// Window length in seconds.
    pub fn window_size_seconds(&self) -> u64 {
        self.window_size_seconds
    }
}

impl FromStr for RateLimitConfig {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            GatekeeperError::Config(format!(
                "invalid rate limit {:?}: expected \"<count>/<second|minute|hour|day>\"",
                s
            ))
        };

        let (count, unit) = s.trim().split_once('/').ok_or_else(invalid)?;
        let count: u32 = count.trim().parse().map_err(|_| invalid())?;
        let unit = TimeUnit::parse(unit.trim()).ok_or_else(invalid)?;

        Self::per(count, unit)
    }
}

impl TryFrom<String> for RateLimitConfig {
    type Error = GatekeeperError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RateLimitConfig> for String {
    fn from(config: RateLimitConfig) -> Self {
        config.to_string()
    }
}

impl fmt::Display for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match TimeUnit::from_seconds(self.window_size_seconds) {
            Some(unit) => write!(f, "{}/{}", self.requests_per_window, unit.name()),
            None => write!(f, "{}/{}s", self.requests_per_window, self.window_size_seconds),
        }
    }
}
