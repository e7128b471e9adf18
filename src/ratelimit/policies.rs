//! Named rate limit policies.
//!
//! Callers usually guard different operations with different budgets, e.g.
//! a tight limit on login attempts next to a generous default for reads.
//! `RateLimitPolicies` holds one limiter per named rule and falls back to the
//! default limiter for names it does not know.

use std::collections::HashMap;

use tracing::{debug, info};

use super::limiter::SlidingWindowRateLimiter;
use super::rules::RateLimitConfig;
use super::window::RateLimitResult;
use crate::clock::{Clock, SystemClock};

/// A set of limiters keyed by policy name.
pub struct RateLimitPolicies<C: Clock + Clone = SystemClock> {
    default: SlidingWindowRateLimiter<C>,
    policies: HashMap<String, SlidingWindowRateLimiter<C>>,
}

impl RateLimitPolicies<SystemClock> {
    /// Build policies driven by the wall clock.
    pub fn new(default: RateLimitConfig, policies: &HashMap<String, RateLimitConfig>) -> Self {
        Self::with_clock(default, policies, SystemClock)
    }
}

impl<C: Clock + Clone> RateLimitPolicies<C> {
    /// Build policies that all share `clock`.
    pub fn with_clock(
        default: RateLimitConfig,
        policies: &HashMap<String, RateLimitConfig>,
        clock: C,
    ) -> Self {
        let policies: HashMap<_, _> = policies
            .iter()
            .map(|(name, config)| {
                debug!(policy = %name, limit = %config, "Registering rate limit policy");
                (
                    name.clone(),
                    SlidingWindowRateLimiter::with_clock(*config, clock.clone()),
                )
            })
            .collect();

        info!(
            default = %default,
            policy_count = policies.len(),
            "Rate limit policies initialized"
        );

        Self {
            default: SlidingWindowRateLimiter::with_clock(default, clock),
            policies,
        }
    }

    /// Check `key` against the named policy, or the default one.
    pub fn check(&self, policy: &str, key: &str) -> RateLimitResult {
        self.limiter(policy).is_allowed(key)
    }

    /// The limiter that enforces `policy`.
    pub fn limiter(&self, policy: &str) -> &SlidingWindowRateLimiter<C> {
        self.policies.get(policy).unwrap_or(&self.default)
    }

    /// Whether `policy` has its own limiter.
    pub fn contains(&self, policy: &str) -> bool {
        self.policies.contains_key(policy)
    }

    /// Forget `key` in every policy. Returns how many limiters tracked it.
    pub fn reset_key(&self, key: &str) -> usize {
        std::iter::once(&self.default)
            .chain(self.policies.values())
            .filter(|limiter| limiter.reset(key))
            .count()
    }

    /// Names of the configured policies, sorted.
    pub fn policy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
