//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::auth::BoundedReplayTracker;
use crate::clock::Clock;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{RateLimitConfig, RateLimitPolicies};
use crate::resilience::CircuitBreakerConfig;

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Refresh-token replay protection configuration
    #[serde(default)]
    pub replay_protection: ReplayProtectionConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limit applied when no named policy matches
    #[serde(default)]
    pub default: RateLimitConfig,

    /// Named policies, e.g. `login: "5/minute"`
    #[serde(default)]
    pub policies: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: RateLimitConfig::default(),
            policies: HashMap::new(),
        }
    }
}

/// Circuit breaker configuration as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Seconds the circuit stays open after the last failure
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_half_open_max_calls() -> u32 {
    2
}

/// Replay protection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayProtectionConfig {
    /// Maximum number of used token identifiers remembered
    #[serde(default = "default_max_tracked")]
    pub max_tracked: usize,
}

impl Default for ReplayProtectionConfig {
    fn default() -> Self {
        Self {
            max_tracked: default_max_tracked(),
        }
    }
}

fn default_max_tracked() -> usize {
    10000
}

impl GatekeeperConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section. Rate limit strings are already checked while parsing.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker_config().validate()?;
        if self.replay_protection.max_tracked == 0 {
            return Err(GatekeeperError::Config(
                "replay_protection.max_tracked must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The circuit breaker section as a breaker config.
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let settings = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_secs(settings.timeout_secs),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }

    /// Build the configured rate limit policies.
    pub fn build_policies<C: Clock + Clone>(&self, clock: C) -> RateLimitPolicies<C> {
        RateLimitPolicies::with_clock(
            self.rate_limiting.default,
            &self.rate_limiting.policies,
            clock,
        )
    }

    /// Build the configured replay tracker.
    pub fn build_replay_tracker<C: Clock>(&self, clock: C) -> Result<BoundedReplayTracker<C>> {
        BoundedReplayTracker::with_clock(self.replay_protection.max_tracked, clock)
    }
}
