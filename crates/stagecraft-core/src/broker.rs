//! The broker abstraction (spec §4.3): a session-scoped, transactional
//! surface the runtime needs from a message broker. The broker client
//! itself — connections, sessions, real transport — is out of scope;
//! this crate only needs the capability described here, and ships no
//! production implementation (see `stagecraft-testkit::InMemoryBroker`
//! for a test double).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// A message as received from the broker, before the trace/payload is
/// decoded. Headers always carry `trace_id` (spec §6) for broker-side
/// filtering/logging; additional headers are tolerated but unused by
/// the runtime.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl RawMessage {
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }
}

/// Session-scoped, transactional broker capability.
///
/// All receives and sends made through one `Broker` handle between a
/// `commit`/`rollback` are grouped into a single broker transaction —
/// the runtime never opens more than one transaction at a time per
/// worker (spec §4.3, §4.4). Redelivery semantics after a `rollback`
/// are entirely the broker's own responsibility; this trait's contract
/// only promises that a rolled-back receive becomes receivable again.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Poll the given queue for one message, waiting up to `timeout`.
    /// Returns `None` on timeout with no message available.
    async fn receive(&self, queue_id: &str, timeout: Duration) -> anyhow::Result<Option<RawMessage>>;

    /// Enqueue `body` on `queue_id` within the current transaction.
    async fn send(&self, queue_id: &str, body: Vec<u8>, headers: HashMap<String, String>) -> anyhow::Result<()>;

    /// Commit everything received/sent since the last commit/rollback.
    async fn commit(&self) -> anyhow::Result<()>;

    /// Roll back everything received/sent since the last commit/rollback.
    /// Received messages become redeliverable; sent messages are discarded.
    async fn rollback(&self) -> anyhow::Result<()>;

    /// Release any session-level resources. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Opens one [`Broker`] session per worker (spec §5: "no worker is
/// shared across stages"; each worker owns its session for its whole
/// lifetime, opening it once and reusing it across many commit/rollback
/// cycles rather than reconnecting per message).
#[async_trait]
pub trait BrokerSessionFactory: Send + Sync {
    async fn open_session(&self) -> anyhow::Result<Arc<dyn Broker>>;
}
