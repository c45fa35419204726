//! Ambient fault isolation for broker/database-facing operations.
//!
//! Nothing in spec.md names a circuit breaker, but the teacher never
//! lets a stage or coordinator call an external dependency without one
//! wrapping the call (see the teacher's `MessageClient::with_breaker`).
//! Carrying the same pattern here means a stage whose broker or
//! database is degraded fails fast instead of piling up blocked
//! workers — orthogonal to the BE-1PC contract in [`crate::coordinator`],
//! which only governs the order of two commits that do happen.

mod behavior;
mod circuit_breaker;
mod metrics;

pub use behavior::CircuitBreakerBehavior;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use metrics::CircuitBreakerMetrics;
