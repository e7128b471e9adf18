//! Circuit breaker for downstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: downstream assumed down, calls are rejected
//! - Half-Open: a limited number of trial calls test for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count reaches failure_threshold
//! Open → Half-Open: timeout elapsed since the last failure (checked on access)
//! Half-Open → Closed: success_count reaches success_threshold
//! Half-Open → Open: any failure
//! ```
//!
//! There is no background timer. The Open → Half-Open move happens the next
//! time the breaker is asked for its state or for permission to run a call.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{GatekeeperError, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    /// Successes in half-open needed to close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open after the last failure
    pub timeout: Duration,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject thresholds of zero, and half-open budgets too small to ever close.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_max_calls", self.half_open_max_calls),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(GatekeeperError::Config(format!(
                    "circuit breaker {} must be greater than zero",
                    name
                )));
            }
        }
        // Every trial call may succeed at most once, so fewer slots than
        // required successes would leave the circuit half-open for good.
        if self.success_threshold > self.half_open_max_calls {
            return Err(GatekeeperError::Config(format!(
                "circuit breaker success_threshold ({}) exceeds half_open_max_calls ({})",
                self.success_threshold, self.half_open_max_calls
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The circuit refused the call; the operation was not run.
    #[error("circuit '{0}' is open")]
    Rejected(String),
    /// The operation ran and failed.
    #[error("guarded call failed: {0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// Whether the circuit refused the call.
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    half_open_calls: u32,
    // Bumped on every entry into half-open, so a stale permit cannot hand
    // back a slot from an earlier trial round.
    half_open_epoch: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_calls: 0,
            half_open_epoch: 0,
        }
    }
}

/// What `acquire` granted.
#[derive(Debug, Clone, Copy)]
enum Permit {
    Closed,
    HalfOpen { epoch: u64 },
}

/// Hands a half-open slot back if the guarded call is dropped unfinished.
struct PendingCall<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    permit: Option<Permit>,
}

impl<C: Clock> PendingCall<'_, C> {
    fn complete(mut self) {
        self.permit = None;
    }
}

impl<C: Clock> Drop for PendingCall<'_, C> {
    fn drop(&mut self) {
        if let Some(Permit::HalfOpen { epoch }) = self.permit.take() {
            self.breaker.release_half_open_slot(epoch);
        }
    }
}

/// A circuit breaker for one protected resource.
///
/// The breaker never fails on its own: it only answers allow/deny and
/// records outcomes reported by the caller.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    clock: C,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker driven by the wall clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker driven by the given clock.
    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, clock))
    }

    pub(crate) fn from_validated(name: String, config: CircuitBreakerConfig, clock: C) -> Self {
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    /// Name of the protected resource.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying the open-timeout check.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may run now.
    ///
    /// In half-open each permitted call uses up one trial slot.
    pub fn can_execute(&self) -> bool {
        self.acquire().is_some()
    }

    fn acquire(&self) -> Option<Permit> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Some(Permit::Closed),
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Some(Permit::HalfOpen {
                        epoch: inner.half_open_epoch,
                    })
                } else {
                    debug!(breaker = %self.name, "Half-open trial slots exhausted");
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn release_half_open_slot(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_epoch == epoch {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
            debug!(breaker = %self.name, "Guarded call dropped, half-open slot released");
        }
    }

    /// Record that a call succeeded.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls = 0;
                    info!(breaker = %self.name, "Circuit closed after successful trial calls");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record that a call failed.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(self.clock.now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        timeout_secs = self.config.timeout.as_secs_f64(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!(breaker = %self.name, "Trial call failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` if the circuit allows it and record its outcome.
    ///
    /// If the returned future is dropped before `operation` finishes, no
    /// outcome is recorded and a half-open trial slot is handed back.
    pub async fn call<F, T, E>(&self, operation: F) -> std::result::Result<T, CallError<E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let permit = match self.acquire() {
            Some(permit) => permit,
            None => return Err(CallError::Rejected(self.name.clone())),
        };
        let pending = PendingCall {
            breaker: self,
            permit: Some(permit),
        };

        let outcome = operation.await;
        pending.complete();

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CallError::Failed(err))
            }
        }
    }

    /// Counters as of now, after applying the open-timeout check.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let epoch = inner.half_open_epoch;
        *inner = BreakerState::closed();
        inner.half_open_epoch = epoch;
        drop(inner);
        info!(breaker = %self.name, "Circuit reset");
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }

        let elapsed = match inner.last_failure_time {
            Some(last) => self.clock.now().signed_duration_since(last),
            None => chrono::Duration::MAX,
        };
        let timeout = chrono::Duration::from_std(self.config.timeout).unwrap_or(chrono::Duration::MAX);

        if elapsed >= timeout {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_calls = 0;
            inner.success_count = 0;
            inner.half_open_epoch += 1;
            info!(breaker = %self.name, "Circuit half-open, admitting trial calls");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn config(failure_threshold: u32, success_threshold: u32, half_open_max_calls: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_secs(30),
            half_open_max_calls,
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> (Arc<ManualClock>, CircuitBreaker<Arc<ManualClock>>) {
        let clock = Arc::new(ManualClock::at_epoch_seconds(1_700_000_000));
        let breaker = CircuitBreaker::with_clock("downstream", config, clock.clone()).unwrap();
        (clock, breaker)
    }

    fn half_open(config: CircuitBreakerConfig) -> (Arc<ManualClock>, CircuitBreaker<Arc<ManualClock>>) {
        let (clock, breaker) = breaker(config);
        for _ in 0..config.failure_threshold {
            breaker.record_failure();
        }
        clock.advance(config.timeout);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        (clock, breaker)
    }

    #[test]
    fn test_starts_closed() {
        let (_clock, breaker) = breaker(config(3, 1, 1));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_trips_at_threshold() {
        for threshold in [1u32, 3, 10] {
            let (_clock, breaker) = breaker(config(threshold, 1, 1));

            for _ in 0..threshold - 1 {
                breaker.record_failure();
            }
            assert_eq!(breaker.state(), CircuitState::Closed);

            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Open);
            assert!(!breaker.can_execute());
        }
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let (_clock, breaker) = breaker(config(3, 1, 1));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.snapshot().failure_count, 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_timeout_gates_half_open() {
        let (clock, breaker) = breaker(config(1, 1, 1));
        breaker.record_failure();

        // Last failure is exactly now.
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(2));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_limited_calls() {
        for (max_calls, extra) in [(1u32, 1u32), (3, 4), (5, 1)] {
            let (_clock, breaker) = half_open(config(2, max_calls, max_calls));

            let admitted = (0..max_calls + extra)
                .filter(|_| breaker.can_execute())
                .count();
            assert_eq!(admitted, max_calls as usize);
        }
    }

    #[test]
    fn test_half_open_successes_close() {
        let (_clock, breaker) = half_open(config(2, 3, 3));

        for _ in 0..2 {
            assert!(breaker.can_execute());
            breaker.record_success();
            assert_eq!(breaker.state(), CircuitState::HalfOpen);
        }

        assert!(breaker.can_execute());
        breaker.record_success();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (clock, breaker) = half_open(config(2, 3, 3));

        assert!(breaker.can_execute());
        breaker.record_success();
        breaker.record_failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.last_failure_time, Some(clock.now()));
        assert!(!breaker.can_execute());

        // The reopened circuit waits a full timeout again.
        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 0);
    }

    #[test]
    fn test_reset_closes() {
        let (_clock, breaker) = breaker(config(1, 1, 1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.last_failure_time, None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        for config in [config(0, 1, 1), config(1, 0, 1), config(1, 1, 0), config(1, 3, 2)] {
            let result = CircuitBreaker::new("bad", config);
            assert!(matches!(result, Err(GatekeeperError::Config(_))));
        }
    }

    #[test]
    fn test_default_config_recovers() {
        let (clock, breaker) = breaker(CircuitBreakerConfig::default());

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        for _ in 0..2 {
            assert!(breaker.can_execute());
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_budget_must_cover_success_threshold() {
        assert!(config(1, 2, 2).validate().is_ok());
        assert!(config(1, 2, 5).validate().is_ok());
        assert!(matches!(
            config(1, 3, 2).validate(),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_concurrent_half_open_admission() {
        let (_clock, breaker) = half_open(config(1, 4, 4));
        let breaker = Arc::new(breaker);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.can_execute())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(admitted, 4);
        assert_eq!(breaker.snapshot().half_open_calls, 4);
    }

    #[test]
    fn test_concurrent_failures_all_counted() {
        let (_clock, breaker) = breaker(config(1000, 1, 1));
        let breaker = Arc::new(breaker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 400);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let (_clock, breaker) = breaker(config(2, 1, 1));

        let ok: std::result::Result<u32, CallError<String>> = breaker.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..2 {
            let failed = breaker.call(async { Err::<u32, _>("boom".to_string()) }).await;
            assert!(matches!(failed, Err(CallError::Failed(ref e)) if e == "boom"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.call(async { Ok::<u32, String>(1) }).await;
        assert!(rejected.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_call_closes_after_recovery() {
        let (clock, breaker) = breaker(config(1, 1, 1));
        let _ = breaker.call(async { Err::<(), _>("down") }).await;

        clock.advance(Duration::from_secs(31));
        let result = breaker.call(async { Ok::<_, &str>("up") }).await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_half_open_slot() {
        let (_clock, breaker) = half_open(config(1, 1, 1));

        let pending = breaker.call(std::future::pending::<std::result::Result<(), String>>());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.half_open_calls, 0);

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_cancelled_call_keeps_new_round_slots() {
        let (clock, breaker) = half_open(config(1, 1, 1));

        let mut pending = Box::pin(breaker.call(std::future::pending::<std::result::Result<(), String>>()));
        assert!(futures::poll!(pending.as_mut()).is_pending());

        // The round ends and a new one starts while the first call hangs.
        breaker.record_failure();
        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());

        drop(pending);
        assert_eq!(breaker.snapshot().half_open_calls, 1);
        assert!(!breaker.can_execute());
    }
}
