//! Resilience primitives for calls to downstream dependencies.

mod circuit_breaker;
mod registry;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
