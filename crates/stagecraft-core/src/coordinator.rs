//! The Best-Effort-One-Phase-Commit transaction coordinator (spec
//! §4.4): binds one broker transaction to at most one database
//! transaction per stage invocation, DB commit strictly before broker
//! commit, and a sanity gate that forces a rollback decision if control
//! ever left a scope without one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::db::{DbConnection, DbConnectionSupplier};
use crate::error::{BrokerOp, DbOp, StageError, StageResult};
use crate::resilience::CircuitBreakerBehavior;

/// What a scope decided to do with its transactions. Produced by the
/// closure passed to [`TransactionCoordinator::run_scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    Commit,
    Rollback,
}

/// Lazily-obtained database connection handle, exposed to the
/// processing lambda through [`ScopeHandle`]. Obtaining one the first
/// time is the "make the database connection observable" trigger from
/// spec §4.4 step 3; the coordinator is the only thing that ever calls
/// `commit`/`rollback`/`close` on it.
pub struct ScopeHandle {
    supplier: Arc<dyn DbConnectionSupplier>,
    breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    connection: Mutex<Option<Box<dyn DbConnection>>>,
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle").finish_non_exhaustive()
    }
}

impl ScopeHandle {
    pub(crate) fn new(supplier: Arc<dyn DbConnectionSupplier>, breaker: Option<Arc<dyn CircuitBreakerBehavior>>) -> Self {
        Self {
            supplier,
            breaker,
            connection: Mutex::new(None),
        }
    }

    /// Obtain (lazily, once per scope) a mutable handle to the
    /// connection, for the caller to downcast via [`crate::db::DbConnection::as_any_mut`]
    /// and issue whatever queries its application needs.
    pub async fn connection(&self) -> StageResult<tokio::sync::MappedMutexGuard<'_, Box<dyn DbConnection>>> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            if let Some(breaker) = &self.breaker {
                if !breaker.should_allow() {
                    return Err(StageError::database(DbOp::Connect, anyhow::anyhow!("circuit breaker open for database connections")));
                }
            }
            let started = std::time::Instant::now();
            let result = self.supplier.connect().await;
            if let Some(breaker) = &self.breaker {
                match &result {
                    Ok(_) => breaker.record_success(started.elapsed()),
                    Err(_) => breaker.record_failure(started.elapsed()),
                }
            }
            let connection = result.map_err(|e| StageError::database(DbOp::Connect, e))?;
            *guard = Some(connection);
        }
        Ok(tokio::sync::MutexGuard::map(guard, |opt| opt.as_mut().expect("just populated")))
    }

    fn was_opened(&self) -> bool {
        // Uses try_lock: this is only ever called after the processing
        // future has resolved, so the lock is uncontended.
        self.connection.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }

    async fn take(&self) -> Option<Box<dyn DbConnection>> {
        self.connection.lock().await.take()
    }
}

/// Defends the sanity-gate invariant (spec §4.4): every scope must end
/// in an explicit commit or rollback. If `run_scope` ever returns
/// without disarming this guard — a bug in the coordinator, not in user
/// code — the drop observes it and logs loudly; it cannot itself force
/// an async rollback from `Drop`, so `run_scope`'s own control flow is
/// written to make that path unreachable rather than relying on this to
/// recover from it.
struct SanityGate {
    armed: bool,
}

impl SanityGate {
    fn new() -> Self {
        Self { armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SanityGate {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("transaction scope exited without an explicit commit or rollback decision");
        }
    }
}

/// Binds exactly one [`Broker`] session and one [`DbConnectionSupplier`]
/// into the BE-1PC protocol described in spec §4.4.
pub struct TransactionCoordinator {
    broker: Arc<dyn Broker>,
    db: Arc<dyn DbConnectionSupplier>,
    db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
}

impl TransactionCoordinator {
    pub fn new(broker: Arc<dyn Broker>, db: Arc<dyn DbConnectionSupplier>) -> Self {
        Self {
            broker,
            db,
            db_breaker: None,
            broker_breaker: None,
        }
    }

    /// Wires the circuit breakers guarding this coordinator's
    /// database/broker-facing calls (spec's ambient resilience layer,
    /// SPEC_FULL §4.9). Either may be `None` — a coordinator with no
    /// breakers configured behaves exactly as before, `should_allow`
    /// simply never gets called.
    pub fn with_breakers(mut self, db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>, broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>) -> Self {
        self.db_breaker = db_breaker;
        self.broker_breaker = broker_breaker;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Runs `body` inside one BE-1PC scope (spec §4.4 steps 1-5):
    /// - `body` gets a [`ScopeHandle`] it may use to lazily obtain a DB
    ///   connection, and returns `Ok(())` to commit or any `StageError`
    ///   to roll back.
    /// - On success: DB commit (if opened) strictly before broker commit.
    /// - On failure (including a panic, caught here): DB rollback (if
    ///   opened) then broker rollback; the rollback-path's own failures
    ///   are logged but never mask the original error (spec §4.4
    ///   "Error reporting").
    pub async fn run_scope<F>(&self, body: F) -> StageResult<ScopeOutcome>
    where
        F: FnOnce(Arc<ScopeHandle>) -> BoxFuture<'static, StageResult<()>>,
    {
        let mut gate = SanityGate::new();
        let handle = Arc::new(ScopeHandle::new(self.db.clone(), self.db_breaker.clone()));

        let result = AssertUnwindSafe(body(handle.clone())).catch_unwind().await;

        let outcome = match result {
            Ok(Ok(())) => self.finish_commit(&handle).await,
            Ok(Err(stage_error)) => {
                self.finish_rollback(&handle).await;
                Err(stage_error)
            }
            Err(panic) => {
                self.finish_rollback(&handle).await;
                let msg = panic_message(&panic);
                Err(StageError::UserFailure(anyhow::anyhow!("stage processor panicked: {msg}")))
            }
        };

        gate.disarm();
        outcome
    }

    async fn finish_commit(&self, handle: &ScopeHandle) -> StageResult<ScopeOutcome> {
        if handle.was_opened() {
            if let Some(mut connection) = handle.take().await {
                if let Err(db_error) = self.guarded_db_op(DbOp::Commit, connection.commit()).await {
                    self.rollback_broker_after_db_failure(&db_error).await;
                    return Err(db_error);
                }
                if let Err(db_error) = self.guarded_db_op(DbOp::Close, connection.close()).await {
                    self.rollback_broker_after_db_failure(&db_error).await;
                    return Err(db_error);
                }
            }
        }
        self.guarded_broker_op(BrokerOp::Commit, self.broker.commit()).await?;
        Ok(ScopeOutcome::Commit)
    }

    /// A DB commit/close failure must still leave the broker transaction
    /// rolled back rather than dangling open (spec §7.4: "Any of these
    /// causes the broker transaction to roll back"). The DB-side error is
    /// what the caller sees; a broker rollback failure on top of that is
    /// logged but never masks it.
    async fn rollback_broker_after_db_failure(&self, db_error: &StageError) {
        if let Err(e) = self.guarded_broker_op(BrokerOp::Rollback, self.broker.rollback()).await {
            tracing::warn!(error = %e, db_error = %db_error, "broker rollback failed after a database commit/close failure; original error preserved");
        }
    }

    async fn finish_rollback(&self, handle: &ScopeHandle) {
        if handle.was_opened() {
            if let Some(mut connection) = handle.take().await {
                if let Err(e) = self.guarded_db_op(DbOp::Rollback, connection.rollback()).await {
                    tracing::warn!(error = %e, "database rollback failed during scope rollback; original error preserved");
                }
                if let Err(e) = self.guarded_db_op(DbOp::Close, connection.close()).await {
                    tracing::warn!(error = %e, "database close failed during scope rollback; original error preserved");
                }
            }
        }
        if let Err(e) = self.guarded_broker_op(BrokerOp::Rollback, self.broker.rollback()).await {
            tracing::warn!(error = %e, "broker rollback failed during scope rollback; original error preserved");
        }
    }

    async fn guarded_db_op<Fut>(&self, op: DbOp, fut: Fut) -> StageResult<()>
    where
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let started = std::time::Instant::now();
        let result = fut.await;
        if let Some(breaker) = &self.db_breaker {
            match &result {
                Ok(()) => breaker.record_success(started.elapsed()),
                Err(_) => breaker.record_failure(started.elapsed()),
            }
        }
        result.map_err(|e| StageError::database(op, e))
    }

    async fn guarded_broker_op<Fut>(&self, op: BrokerOp, fut: Fut) -> StageResult<()>
    where
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let started = std::time::Instant::now();
        let result = fut.await;
        if let Some(breaker) = &self.broker_breaker {
            match &result {
                Ok(()) => breaker.record_success(started.elapsed()),
                Err(_) => breaker.record_failure(started.elapsed()),
            }
        }
        result.map_err(|e| StageError::broker(op, e))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::broker::RawMessage;

    #[derive(Default)]
    struct CountingBroker {
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[async_trait]
    impl Broker for CountingBroker {
        async fn receive(&self, _queue_id: &str, _timeout: Duration) -> anyhow::Result<Option<RawMessage>> {
            Ok(None)
        }
        async fn send(&self, _queue_id: &str, _body: Vec<u8>, _headers: HashMap<String, String>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn commit(&self) -> anyhow::Result<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(&self) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoDbSupplier;

    #[async_trait]
    impl DbConnectionSupplier for NoDbSupplier {
        async fn connect(&self) -> anyhow::Result<Box<dyn DbConnection>> {
            unreachable!("test bodies in this module never open a connection")
        }
    }

    fn coordinator() -> (Arc<CountingBroker>, TransactionCoordinator) {
        let broker = Arc::new(CountingBroker::default());
        let coordinator = TransactionCoordinator::new(broker.clone(), Arc::new(NoDbSupplier));
        (broker, coordinator)
    }

    #[tokio::test]
    async fn successful_body_commits_the_broker() {
        let (broker, coordinator) = coordinator();
        let outcome = coordinator.run_scope(|_handle| async { Ok(()) }.boxed()).await.unwrap();
        assert_eq!(outcome, ScopeOutcome::Commit);
        assert_eq!(broker.commits.load(Ordering::SeqCst), 1);
        assert_eq!(broker.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_body_rolls_back_the_broker() {
        let (broker, coordinator) = coordinator();
        let result = coordinator.run_scope(|_handle| async { Err(StageError::refused("bad message")) }.boxed()).await;
        assert!(result.is_err());
        assert_eq!(broker.commits.load(Ordering::SeqCst), 0);
        assert_eq!(broker.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_body_rolls_back_and_is_reported_as_user_failure() {
        let (broker, coordinator) = coordinator();
        let result = coordinator.run_scope(|_handle| async { panic!("boom") }.boxed()).await;
        assert!(matches!(result, Err(StageError::UserFailure(_))));
        assert_eq!(broker.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(broker.commits.load(Ordering::SeqCst), 0);
    }
}
