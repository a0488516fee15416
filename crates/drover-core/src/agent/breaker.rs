//! Per-agent circuit breaker.
//!
//! Three states: closed (normal), open (failing fast), half-open (probing).
//! Only the transition decisions and counters run under the lock; the
//! wrapped call itself runs unlocked.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AgentError;

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in the closed state that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub reset_timeout: Duration,
    /// Deadline on each half-open probe; an overrun counts as a failure.
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(10),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u64,
    success_count: u32,
    consecutive_errors: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

/// Snapshot of breaker counters for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u32,
    pub consecutive_errors: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

/// A three-state circuit breaker gating calls to one agent.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                consecutive_errors: 0,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    /// Run `f` through the gate.
    ///
    /// Open circuit: fails fast with [`AgentError::CircuitOpen`] until
    /// `reset_timeout` has elapsed since the last failure, at which point
    /// the next call transitions to half-open and is admitted as a probe.
    /// Half-open probes run under `half_open_timeout`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let state = self.check_gate()?;

        let result = if state == CircuitState::HalfOpen {
            match tokio::time::timeout(self.config.half_open_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout),
            }
        } else {
            f().await
        };

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Current state (with the open-to-half-open clock applied lazily).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        BreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_errors: inner.consecutive_errors,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
        }
    }

    /// Admit or refuse the next call, moving open to half-open once the
    /// reset timeout has elapsed. Returns the state the call runs under.
    fn check_gate(&self) -> Result<CircuitState, AgentError> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let reset_elapsed = inner.last_failure.is_none_or(|at| {
                Utc::now().signed_duration_since(at)
                    >= chrono::Duration::from_std(self.config.reset_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            });
            if reset_elapsed {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            }
        }

        if inner.state == CircuitState::Open {
            return Err(AgentError::CircuitOpen);
        }
        Ok(inner.state)
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.consecutive_errors += 1;
        inner.last_failure = Some(Utc::now());
        inner.success_count = 0;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_errors >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.consecutive_errors = 0;
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.consecutive_errors = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count += 1;
        inner.last_success = Some(Utc::now());
        inner.consecutive_errors = 0;

        if inner.state == CircuitState::HalfOpen
            && inner.success_count >= self.config.success_threshold
        {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
