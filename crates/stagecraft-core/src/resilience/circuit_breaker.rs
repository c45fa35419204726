//! A minimal closed/open/half-open circuit breaker protecting
//! broker/database-facing operations from hammering a known-bad
//! upstream. This does not change the BE-1PC algorithm in spec §4.4 —
//! it only fails fast *before* attempting an operation, which is an
//! optimization layered outside the coordinator's commit/rollback
//! contract.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bon::Builder;
use serde::{Deserialize, Serialize};

use super::{CircuitBreakerBehavior, CircuitBreakerMetrics};

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for [`CircuitBreaker`].
#[derive(Debug, Clone, Builder)]
pub struct CircuitBreakerConfig {
    #[builder(default = 5)]
    pub failure_threshold: u32,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    #[builder(default = 2)]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<(CircuitState, Instant)>,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    total_duration_micros: AtomicU64,
}

/// A single named circuit breaker guarding one upstream dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Inner,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Inner {
                state: Mutex::new((CircuitState::Closed, Instant::now())),
                total_calls: AtomicU64::new(0),
                success_count: AtomicU64::new(0),
                failure_count: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                half_open_successes: AtomicU32::new(0),
                total_duration_micros: AtomicU64::new(0),
            },
        }
    }

    fn transition_if_timeout_elapsed(&self) {
        let mut guard = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if guard.0 == CircuitState::Open && guard.1.elapsed() >= self.config.timeout {
            guard.0 = CircuitState::HalfOpen;
            self.inner.half_open_successes.store(0, Ordering::SeqCst);
        }
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        self.transition_if_timeout_elapsed();
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner()).0
    }

    fn should_allow(&self) -> bool {
        self.transition_if_timeout_elapsed();
        !matches!(self.state(), CircuitState::Open)
    }

    fn record_success(&self, duration: Duration) {
        self.inner.total_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.success_count.fetch_add(1, Ordering::SeqCst);
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
        self.inner
            .total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);

        let mut guard = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if guard.0 == CircuitState::HalfOpen {
            let successes = self.inner.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold {
                guard.0 = CircuitState::Closed;
            }
        }
    }

    fn record_failure(&self, duration: Duration) {
        self.inner.total_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.failure_count.fetch_add(1, Ordering::SeqCst);
        let consecutive = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);

        let mut guard = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        let should_open = matches!(guard.0, CircuitState::HalfOpen) || consecutive >= self.config.failure_threshold;
        if should_open {
            guard.0 = CircuitState::Open;
            guard.1 = Instant::now();
        }
    }

    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn force_open(&self) {
        let mut guard = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.0 = CircuitState::Open;
        guard.1 = Instant::now();
    }

    fn force_closed(&self) {
        let mut guard = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.0 = CircuitState::Closed;
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.inner.total_calls.load(Ordering::SeqCst),
            success_count: self.inner.success_count.load(Ordering::SeqCst),
            failure_count: self.inner.failure_count.load(Ordering::SeqCst),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::SeqCst) as u64,
            current_state: self.state(),
            total_duration: Duration::from_micros(self.inner.total_duration_micros.load(Ordering::SeqCst)),
        }
    }
}
