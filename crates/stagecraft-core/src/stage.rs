//! The per-stage worker pool (spec §4.5): N concurrent consumers on one
//! logical queue, each wrapping its receive/dispatch/send cycle in a
//! [`crate::coordinator::TransactionCoordinator`] scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::broker::BrokerSessionFactory;
use crate::context::StageContext;
use crate::coordinator::{ScopeHandle, TransactionCoordinator};
use crate::db::DbConnectionSupplier;
use crate::dispatch::StageDispatch;
use crate::error::{BrokerOp, StageError, StageResult};
use crate::resilience::CircuitBreakerBehavior;
use crate::serializer::TraceCodec;

/// Tunables for one stage. `concurrency: None` means "inherit" (spec
/// §4.5, §6's `setConcurrency(0)`); resolution to a concrete worker
/// count happens in [`crate::endpoint::Endpoint::start`].
#[derive(Debug, Clone, Builder)]
pub struct StageConfig {
    pub concurrency: Option<usize>,
    #[builder(default = Duration::from_millis(500))]
    pub poll_timeout: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub stop_grace_period: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct StageResources {
    stage_id: String,
    next_stage_id: Option<String>,
    dispatch: StageDispatch,
    session_factory: Arc<dyn BrokerSessionFactory>,
    db: Arc<dyn DbConnectionSupplier>,
    codec: Arc<dyn TraceCodec>,
    config: StageConfig,
    db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
}

/// One consumer group for one logical queue. Non-generic: the
/// `Incoming`/`State`/`Reply` types a stage's author writes against are
/// erased into `dispatch` at construction time (see `crate::endpoint`).
pub struct Stage {
    resources: Arc<StageResources>,
    concurrency: usize,
    run_state: Mutex<Option<RunningWorkers>>,
}

struct RunningWorkers {
    stop_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Stage {
    pub(crate) fn new(
        stage_id: impl Into<String>,
        next_stage_id: Option<String>,
        dispatch: StageDispatch,
        session_factory: Arc<dyn BrokerSessionFactory>,
        db: Arc<dyn DbConnectionSupplier>,
        codec: Arc<dyn TraceCodec>,
        config: StageConfig,
        default_concurrency: usize,
        db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
        broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    ) -> Self {
        let concurrency = match config.concurrency {
            Some(0) | None => default_concurrency.max(1),
            Some(n) => n,
        };
        Self {
            resources: Arc::new(StageResources {
                stage_id: stage_id.into(),
                next_stage_id,
                dispatch,
                session_factory,
                db,
                codec,
                config,
                db_breaker,
                broker_breaker,
            }),
            concurrency,
            run_state: Mutex::new(None),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.resources.stage_id
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn is_running(&self) -> bool {
        self.run_state.lock().await.is_some()
    }

    /// Idempotent: starting an already-running stage is a no-op.
    pub async fn start(&self) {
        let mut guard = self.run_state.lock().await;
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for worker_index in 0..self.concurrency {
            let resources = self.resources.clone();
            let stop_rx = stop_rx.clone();
            tasks.spawn(async move {
                run_worker(resources, worker_index, stop_rx).await;
            });
        }
        *guard = Some(RunningWorkers { stop_tx, tasks });
    }

    /// Idempotent: blocks until all in-flight scopes complete or
    /// `stop_grace_period` elapses, whichever is first (spec §4.5,
    /// §5's "Cancellation and timeouts"). Workers still running after
    /// the grace period are aborted; their in-progress scope rolls back
    /// via the coordinator's own unwind handling.
    pub async fn stop(&self) {
        let mut guard = self.run_state.lock().await;
        let Some(mut running) = guard.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        let grace = self.resources.config.stop_grace_period;
        if tokio::time::timeout(grace, async {
            while running.tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tracing::warn!(stage = %self.resources.stage_id, "stop grace period elapsed; aborting remaining workers");
            running.tasks.abort_all();
            while running.tasks.join_next().await.is_some() {}
        }
    }
}

async fn run_worker(resources: Arc<StageResources>, worker_index: usize, mut stop_rx: watch::Receiver<bool>) {
    let session = match resources.session_factory.open_session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(stage = %resources.stage_id, worker = worker_index, error = %e, "failed to open broker session; worker exiting");
            return;
        }
    };
    let coordinator = TransactionCoordinator::new(session.clone(), resources.db.clone())
        .with_breakers(resources.db_breaker.clone(), resources.broker_breaker.clone());

    while !*stop_rx.borrow() {
        let session = session.clone();
        let resources = resources.clone();
        let outcome = coordinator
            .run_scope(move |handle| {
                let session = session.clone();
                let resources = resources.clone();
                async move { process_one(&resources, session.as_ref(), handle).await }.boxed()
            })
            .await;

        if let Err(e) = outcome {
            tracing::warn!(stage = %resources.stage_id, worker = worker_index, error = %e, "stage scope rolled back");
        }
    }

    if let Err(e) = session.close().await {
        tracing::warn!(stage = %resources.stage_id, worker = worker_index, error = %e, "failed to close broker session");
    }
}

async fn process_one(resources: &StageResources, session: &dyn crate::broker::Broker, db: Arc<ScopeHandle>) -> StageResult<()> {
    let raw = session
        .receive(&resources.stage_id, resources.config.poll_timeout)
        .await
        .map_err(|e| StageError::broker(BrokerOp::Receive, e))?;
    let Some(raw) = raw else {
        return Ok(());
    };

    let trace = resources.codec.decode_trace(&raw.body)?;
    tracing::debug!(stage = %resources.stage_id, trace_id = %trace.trace_id(), hop = trace.hop_count(), "dispatching");

    let ctx = StageContext::new(resources.stage_id.clone(), resources.next_stage_id.clone(), trace, db);
    let ctx = (resources.dispatch)(ctx).await?;
    let (outgoing, initiated) = ctx.into_outgoing();

    for out in initiated.into_iter().chain(outgoing) {
        let body = resources.codec.encode_trace(&out.trace)?;
        let mut headers = HashMap::new();
        headers.insert("trace_id".to_string(), out.trace.trace_id().to_string());
        headers.insert("message_id".to_string(), uuid::Uuid::new_v4().to_string());
        session
            .send(&out.queue_id, body, headers)
            .await
            .map_err(|e| StageError::broker(BrokerOp::Send, e))?;
    }

    Ok(())
}
