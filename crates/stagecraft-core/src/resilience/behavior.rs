//! Unified circuit breaker interface (ambient fault isolation, see
//! [`crate::resilience`] module docs for why this is carried despite
//! not being named in spec.md).

use std::time::Duration;

use super::{CircuitBreakerMetrics, CircuitState};

/// Interface every circuit breaker implementation satisfies. Object-safe
/// so health-reporting code can hold `&dyn CircuitBreakerBehavior`
/// uniformly; the coordinator and stage runtime use the concrete
/// [`super::CircuitBreaker`] directly on their hot paths.
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self, duration: Duration);
    fn record_failure(&self, duration: Duration);
    fn is_healthy(&self) -> bool;
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn CircuitBreakerBehavior) {}
}
