//! Gatekeeper - in-process request guards
//!
//! This crate provides three independent guards for request-handling code:
//! a sliding window rate limiter, a circuit breaker for downstream calls and
//! a bounded tracker that refuses replayed refresh tokens. Each keeps its
//! own per-key state behind a lock and takes an injectable clock.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod resilience;
