//! One circuit breaker per protected resource.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Hands out breakers by resource name, creating them on first use.
///
/// Breakers share a config and a clock but never share state.
pub struct CircuitBreakerRegistry<C: Clock + Clone = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    breakers: DashMap<String, Arc<CircuitBreaker<C>>>,
}

impl CircuitBreakerRegistry<SystemClock> {
    /// Create a registry driven by the wall clock.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock + Clone> CircuitBreakerRegistry<C> {
    /// Create a registry whose breakers use `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            breakers: DashMap::new(),
        })
    }

    /// The breaker guarding `resource`.
    pub fn get(&self, resource: &str) -> Arc<CircuitBreaker<C>> {
        if let Some(breaker) = self.breakers.get(resource) {
            return breaker.clone();
        }

        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                debug!(resource = %resource, "Creating circuit breaker");
                Arc::new(CircuitBreaker::from_validated(
                    resource.to_string(),
                    self.config,
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Current state of every breaker, sorted by resource name.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Get the number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
