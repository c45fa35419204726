//! Best-Effort-One-Phase-Commit scenarios from spec §8 (scenarios 4 and
//! 5), exercised directly against `TransactionCoordinator` and
//! `stagecraft-testkit`'s in-memory broker/database doubles — the
//! layer these scenarios are actually about, without the extra moving
//! parts of the full stage worker loop.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use stagecraft_core::broker::{Broker, BrokerSessionFactory};
use stagecraft_core::coordinator::TransactionCoordinator;
use stagecraft_core::db::DbConnection;
use stagecraft_core::error::{BrokerOp, StageError};
use stagecraft_core::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};
use stagecraft_testkit::{FakeDbConnection, FakeDbSupplier, InMemoryBrokerFactory};

/// Scenario 4: user code inserts a row and sends a reply. Expected: DB
/// row visible, reply delivered exactly once, no redelivery of the
/// original request.
#[tokio::test]
async fn db_be_1pc_success_commits_db_before_broker_and_does_not_redeliver() {
    let broker_factory = InMemoryBrokerFactory::new();
    broker_factory.seed("stage-q", b"request".to_vec(), Default::default()).await;

    let session = broker_factory.open_session().await.unwrap();
    let db = Arc::new(FakeDbSupplier::new());
    let coordinator = TransactionCoordinator::new(session.clone(), db.clone());

    let outcome = coordinator
        .run_scope(|handle| {
            let session = session.clone();
            async move {
                session
                    .receive("stage-q", Duration::from_millis(50))
                    .await
                    .map_err(|e| StageError::broker(BrokerOp::Receive, e))?;

                let mut conn = handle.connection().await?;
                conn.as_any_mut().downcast_mut::<FakeDbConnection>().unwrap().insert_row("alice");
                drop(conn);

                session
                    .send("reply-q", b"reply".to_vec(), Default::default())
                    .await
                    .map_err(|e| StageError::broker(BrokerOp::Send, e))?;
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(outcome.is_ok());
    assert_eq!(db.visible_rows(), vec!["alice".to_string()], "DB side effect must be visible after a committed scope");
    assert_eq!(broker_factory.queue_len("stage-q").await, 0, "request must not be redelivered on success");
    assert_eq!(broker_factory.queue_len("reply-q").await, 1, "reply must be delivered exactly once");
}

/// Scenario 5: stage inserts a row, then fails. Expected: no DB row
/// visible, original request redelivered by the broker, no reply sent.
#[tokio::test]
async fn user_failure_rolls_back_db_and_redelivers_the_request() {
    let broker_factory = InMemoryBrokerFactory::new();
    broker_factory.seed("stage-q", b"request".to_vec(), Default::default()).await;

    let session = broker_factory.open_session().await.unwrap();
    let db = Arc::new(FakeDbSupplier::new());
    let coordinator = TransactionCoordinator::new(session.clone(), db.clone());

    let outcome = coordinator
        .run_scope(|handle| {
            let session = session.clone();
            async move {
                session
                    .receive("stage-q", Duration::from_millis(50))
                    .await
                    .map_err(|e| StageError::broker(BrokerOp::Receive, e))?;

                let mut conn = handle.connection().await?;
                conn.as_any_mut().downcast_mut::<FakeDbConnection>().unwrap().insert_row("alice");
                drop(conn);

                session
                    .send("reply-q", b"reply".to_vec(), Default::default())
                    .await
                    .map_err(|e| StageError::broker(BrokerOp::Send, e))?;

                Err(StageError::refused("malformed message"))
            }
            .boxed()
        })
        .await;

    assert!(outcome.is_err());
    assert!(db.visible_rows().is_empty(), "a rolled-back scope must leave no DB row visible");
    assert_eq!(broker_factory.queue_len("stage-q").await, 1, "request must be redelivered after rollback");
    assert_eq!(broker_factory.queue_len("reply-q").await, 0, "no reply should have been sent on rollback");
}

/// A DB commit failure still rolls back the broker transaction: the
/// coordinator's sanity gate requires a single terminal decision, and a
/// failed DB commit is reported as a database failure that forces the
/// broker side to roll back too (spec §4.4, §7.4).
#[tokio::test]
async fn db_commit_failure_still_rolls_back_the_broker_transaction() {
    let broker_factory = InMemoryBrokerFactory::new();
    broker_factory.seed("stage-q", b"request".to_vec(), Default::default()).await;

    let session = broker_factory.open_session().await.unwrap();
    let db = Arc::new(FakeDbSupplier::with_failures(stagecraft_testkit::FakeDbFailures {
        fail_commit: true,
        ..Default::default()
    }));
    let coordinator = TransactionCoordinator::new(session.clone(), db.clone());

    let outcome = coordinator
        .run_scope(|handle| {
            let session = session.clone();
            async move {
                session
                    .receive("stage-q", Duration::from_millis(50))
                    .await
                    .map_err(|e| StageError::broker(BrokerOp::Receive, e))?;
                let mut conn = handle.connection().await?;
                conn.as_any_mut().downcast_mut::<FakeDbConnection>().unwrap().insert_row("alice");
                drop(conn);
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(matches!(outcome, Err(StageError::Database { .. })));
    assert_eq!(broker_factory.queue_len("stage-q").await, 1, "broker must roll back (redeliver) when the DB commit fails");
}

/// A forced-open database breaker, wired through `with_breakers`, fails
/// a connection attempt immediately instead of reaching the supplier,
/// and the scope still rolls back the broker transaction — the breaker
/// only changes how fast the failure surfaces, not the BE-1PC outcome.
#[tokio::test]
async fn open_db_breaker_fails_connection_attempts_without_reaching_the_supplier() {
    let broker_factory = InMemoryBrokerFactory::new();
    broker_factory.seed("stage-q", b"request".to_vec(), Default::default()).await;

    let session = broker_factory.open_session().await.unwrap();
    let db = Arc::new(FakeDbSupplier::new());
    let db_breaker: Arc<dyn CircuitBreakerBehavior> = Arc::new(CircuitBreaker::new("db", CircuitBreakerConfig::default()));
    db_breaker.force_open();
    let coordinator = TransactionCoordinator::new(session.clone(), db.clone()).with_breakers(Some(db_breaker), None);

    let outcome = coordinator
        .run_scope(|handle| {
            let session = session.clone();
            async move {
                session
                    .receive("stage-q", Duration::from_millis(50))
                    .await
                    .map_err(|e| StageError::broker(BrokerOp::Receive, e))?;
                handle.connection().await?;
                Ok(())
            }
            .boxed()
        })
        .await;

    assert!(matches!(outcome, Err(StageError::Database { .. })));
    assert!(db.visible_rows().is_empty(), "the breaker must short-circuit before the supplier is ever reached");
    assert_eq!(broker_factory.queue_len("stage-q").await, 1, "the request must still be redelivered when the breaker trips the scope");
}
