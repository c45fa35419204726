//! The registry of endpoints and the root of the runtime's lifecycle
//! (spec §4.7). A `Factory` owns the collaborators every endpoint on it
//! shares (broker session factory, database connection supplier, one
//! serializer) and the default concurrency new stages inherit unless
//! they set their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bon::Builder;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::broker::BrokerSessionFactory;
use crate::db::DbConnectionSupplier;
use crate::endpoint::{Endpoint, EndpointBuilder, EndpointCollaborators, EndpointRuntime};
use crate::error::StageResult;
use crate::initiator::Initiator;
use crate::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};
use crate::serializer::{Serializer as ValueSerializer, TraceCodec};
use crate::stage::StageConfig;

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1)
}

/// Tunables shared by every endpoint a [`Factory`] creates. The two
/// breaker configs are opt-in: leaving either `None` means the
/// corresponding coordinator call site runs with no circuit breaker at
/// all, exactly as before this field existed.
#[derive(Debug, Clone, Builder)]
pub struct FactoryConfig {
    #[builder(default = hardware_concurrency())]
    pub default_concurrency: usize,
    pub db_breaker: Option<CircuitBreakerConfig>,
    pub broker_breaker: Option<CircuitBreakerConfig>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The registry of endpoints (spec §4.7): creates endpoints and
/// initiators, aggregates `start`/`stop`/`isRunning` across everything
/// registered on it. Registration is concurrent-safe via `dashmap`; the
/// registry is intended to be populated during setup and then frozen in
/// practice (no removal API), matching §9's "accept dynamic
/// registration before start; freeze at start for lock-free reads".
pub struct Factory<S: ValueSerializer + 'static> {
    serializer: Arc<S>,
    session_factory: Arc<dyn BrokerSessionFactory>,
    db: Arc<dyn DbConnectionSupplier>,
    db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    config: FactoryConfig,
    endpoints: DashMap<String, Arc<dyn EndpointRuntime>>,
    started: AtomicBool,
}

impl<S: ValueSerializer + 'static> std::fmt::Debug for Factory<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("endpoints", &self.endpoint_ids())
            .field("default_concurrency", &self.config.default_concurrency)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S: ValueSerializer + 'static> Factory<S> {
    pub fn new(serializer: S, session_factory: Arc<dyn BrokerSessionFactory>, db: Arc<dyn DbConnectionSupplier>, config: FactoryConfig) -> Self {
        let db_breaker = config
            .db_breaker
            .clone()
            .map(|c| Arc::new(CircuitBreaker::new("db", c)) as Arc<dyn CircuitBreakerBehavior>);
        let broker_breaker = config
            .broker_breaker
            .clone()
            .map(|c| Arc::new(CircuitBreaker::new("broker", c)) as Arc<dyn CircuitBreakerBehavior>);
        Self {
            serializer: Arc::new(serializer),
            session_factory,
            db,
            db_breaker,
            broker_breaker,
            config,
            endpoints: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn default_concurrency(&self) -> usize {
        self.config.default_concurrency
    }

    /// Opens a builder for a new endpoint. Stages added through it share
    /// this factory's broker/db/serializer and default concurrency.
    /// Mirrors the `staged` helper — both just hand back the same
    /// builder; `staged` exists so call sites read as "this endpoint has
    /// more than one stage" without implying anything structural.
    pub fn endpoint(&self, id: impl Into<String>) -> EndpointBuilder<S> {
        let codec: Arc<dyn TraceCodec> = self.serializer.clone() as Arc<dyn TraceCodec>;
        EndpointBuilder::new(
            id,
            self.serializer.clone(),
            EndpointCollaborators {
                session_factory: self.session_factory.clone(),
                db: self.db.clone(),
                codec,
                default_concurrency: self.config.default_concurrency,
                db_breaker: self.db_breaker.clone(),
                broker_breaker: self.broker_breaker.clone(),
            },
        )
    }

    /// Sugar for a multi-stage endpoint: identical to [`Factory::endpoint`],
    /// named for readability at call sites that chain several `.stage(...)`
    /// calls before `.last_stage(...)`.
    pub fn staged(&self, id: impl Into<String>) -> EndpointBuilder<S> {
        self.endpoint(id)
    }

    /// Creates and registers a one-stage endpoint: `.endpoint(id).last_stage(...)`
    /// in a single call, for the common case of a request/reply service
    /// with no intermediate hops.
    pub async fn single<In, St, Re, F>(&self, id: impl Into<String>, config: StageConfig, processor: F) -> Arc<Endpoint>
    where
        In: DeserializeOwned + Send + 'static,
        St: DeserializeOwned + Default + Send + 'static,
        Re: Serialize + Send + 'static,
        F: for<'a> Fn(&'a mut crate::context::TypedStageContext<'a, S>, In, St) -> BoxFuture<'a, StageResult<Option<Re>>> + Send + Sync + 'static,
    {
        let endpoint = self.endpoint(id).last_stage(config, processor);
        self.register(endpoint).await
    }

    /// Creates and registers a terminator endpoint: one stage, no reply
    /// type, `reply` is always a no-op (spec §4.6's "pure terminator").
    pub async fn terminator<In, St, F>(&self, id: impl Into<String>, config: StageConfig, processor: F) -> Arc<Endpoint>
    where
        In: DeserializeOwned + Send + 'static,
        St: DeserializeOwned + Default + Send + 'static,
        F: for<'a> Fn(&'a mut crate::context::TypedStageContext<'a, S>, In, St) -> BoxFuture<'a, StageResult<()>> + Send + Sync + 'static,
    {
        let endpoint = self.endpoint(id).last_stage::<In, St, (), _>(config, move |ctx, incoming, state| {
            let processor = &processor;
            Box::pin(async move {
                processor(ctx, incoming, state).await?;
                Ok(None)
            })
        });
        self.register(endpoint).await
    }

    /// Adds a finished [`Endpoint`] to the registry. If the factory is
    /// already started, the endpoint starts immediately; otherwise it
    /// waits for [`Factory::start`] — "the factory defers until fully
    /// started" (spec §4.5).
    pub async fn register(&self, endpoint: Endpoint) -> Arc<Endpoint> {
        let endpoint = Arc::new(endpoint);
        self.endpoints.insert(endpoint.id().to_string(), endpoint.clone() as Arc<dyn EndpointRuntime>);
        if self.started.load(Ordering::SeqCst) {
            endpoint.start().await;
        }
        endpoint
    }

    /// Hands back an [`Initiator`] addressed `from` the given id. An
    /// initiator is not itself registered — it owns no stages and has
    /// no lifecycle of its own beyond the scope of each `initiate` call.
    pub fn initiator(&self, id: impl Into<String>) -> Initiator<S> {
        Initiator::new(
            id,
            self.serializer.clone(),
            self.session_factory.clone(),
            self.db.clone(),
            self.db_breaker.clone(),
            self.broker_breaker.clone(),
        )
    }

    /// Idempotent. Starts every endpoint registered so far; endpoints
    /// registered afterward start immediately (see [`Factory::register`]).
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.endpoints.iter() {
            entry.value().start().await;
        }
    }

    /// Idempotent. Stops every registered endpoint and marks the
    /// factory not-started.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in self.endpoints.iter() {
            entry.value().stop().await;
        }
    }

    /// True iff any registered endpoint is running.
    pub async fn is_running(&self) -> bool {
        for entry in self.endpoints.iter() {
            if entry.value().is_running().await {
                return true;
            }
        }
        false
    }

    /// Stops all endpoints and releases broker connections. Each
    /// stage's worker closes its own broker session as it exits during
    /// `stop`, so this is `stop` plus the documentation that it is the
    /// terminal call in the factory's lifecycle.
    pub async fn close(&self) {
        self.stop().await;
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_concurrency_falls_back_to_available_parallelism() {
        let config = FactoryConfig::default();
        assert!(config.default_concurrency >= 1);
    }

    #[test]
    fn explicit_default_concurrency_is_honored() {
        let config = FactoryConfig::builder().default_concurrency(3).build();
        assert_eq!(config.default_concurrency, 3);
    }
}
