//! Circuit breaker metrics — ambient observability, not a spec.md
//! feature, carried because the teacher's resilience stack always
//! pairs a breaker with a metrics snapshot (see `resilience::behavior`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::CircuitState;

/// Point-in-time snapshot of one breaker's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub current_state: CircuitState,
    pub total_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            current_state: CircuitState::Closed,
            total_duration: Duration::ZERO,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_calls as f64
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate() < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metrics_are_healthy_and_closed() {
        let m = CircuitBreakerMetrics::new();
        assert_eq!(m.current_state, CircuitState::Closed);
        assert!(m.is_healthy());
        assert_eq!(m.failure_rate(), 0.0);
    }

    #[test]
    fn open_state_is_never_healthy() {
        let mut m = CircuitBreakerMetrics::new();
        m.current_state = CircuitState::Open;
        assert!(!m.is_healthy());
    }
}
