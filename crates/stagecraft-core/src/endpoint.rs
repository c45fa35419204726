//! Ordered composition of stages sharing one state type and one reply
//! type (spec §4.6). `EndpointBuilder::stage`/`last_stage` are the only
//! places a concrete `Incoming`/`State` pair and a concrete
//! [`Serializer`] exist together — every stage they produce is
//! immediately erased into a [`StageDispatch`], so `Endpoint` itself
//! carries no generic parameters and can be stored uniformly in a
//! [`crate::factory::Factory`] registry.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::broker::BrokerSessionFactory;
use crate::context::TypedStageContext;
use crate::db::DbConnectionSupplier;
use crate::dispatch::StageDispatch;
use crate::error::StageResult;
use crate::resilience::CircuitBreakerBehavior;
use crate::serializer::{Serializer as ValueSerializer, TraceCodec};
use crate::stage::{Stage, StageConfig};

/// Object-safe surface the [`crate::factory::Factory`] registry needs:
/// lifecycle control without knowing any endpoint's concrete types.
#[async_trait]
pub trait EndpointRuntime: Send + Sync {
    fn endpoint_id(&self) -> &str;
    fn first_stage_id(&self) -> &str;
    async fn is_running(&self) -> bool;
    async fn start(&self);
    async fn stop(&self);
}

/// An ordered set of stages under one id (spec §3, §4.6).
pub struct Endpoint {
    id: String,
    stages: Vec<Stage>,
    finalized: bool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("stage_ids", &self.stage_ids())
            .field("finalized", &self.finalized)
            .finish()
    }
}

#[async_trait]
impl EndpointRuntime for Endpoint {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    fn first_stage_id(&self) -> &str {
        self.stages.first().map(|s| s.stage_id()).unwrap_or(&self.id)
    }

    async fn is_running(&self) -> bool {
        for stage in &self.stages {
            if stage.is_running().await {
                return true;
            }
        }
        false
    }

    async fn start(&self) {
        for stage in &self.stages {
            stage.start().await;
        }
    }

    async fn stop(&self) {
        for stage in &self.stages {
            stage.stop().await;
        }
    }
}

impl Endpoint {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage_id()).collect()
    }
}

/// Collaborators every stage on an endpoint shares; captured once by
/// [`EndpointBuilder::new`] and threaded into each stage it builds.
#[derive(Clone)]
pub struct EndpointCollaborators {
    pub session_factory: Arc<dyn BrokerSessionFactory>,
    pub db: Arc<dyn DbConnectionSupplier>,
    pub codec: Arc<dyn TraceCodec>,
    pub default_concurrency: usize,
    pub db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    pub broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
}

/// Builds one [`Endpoint`], one stage at a time, generic over whatever
/// concrete `Serializer` the host application uses. The builder itself
/// is never stored past `start()` — only the finished, type-erased
/// `Endpoint` is.
pub struct EndpointBuilder<S: ValueSerializer + 'static> {
    id: String,
    serializer: Arc<S>,
    collaborators: EndpointCollaborators,
    stages: Vec<Stage>,
}

impl<S: ValueSerializer + 'static> EndpointBuilder<S> {
    pub fn new(id: impl Into<String>, serializer: Arc<S>, collaborators: EndpointCollaborators) -> Self {
        Self {
            id: id.into(),
            serializer,
            collaborators,
            stages: Vec::new(),
        }
    }

    fn next_stage_id(&self, own_index: usize) -> String {
        if own_index == 0 {
            format!("{}.1", self.id)
        } else {
            format!("{}.{}", self.id, own_index + 1)
        }
    }

    fn stage_id_for(&self, index: usize) -> String {
        if index == 0 {
            self.id.clone()
        } else {
            format!("{}.{}", self.id, index)
        }
    }

    /// Appends a non-terminal stage. `processor` receives the decoded
    /// incoming payload and frame state, plus a [`TypedStageContext`]
    /// to dispatch `request`/`reply`/`next`/`initiate`, and returns a
    /// boxed future so it can `.await` a database connection (spec §9's
    /// lazy connection accessor) without the runtime ever blocking a
    /// worker thread on it.
    pub fn stage<In, St, F>(mut self, config: StageConfig, processor: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        St: DeserializeOwned + Default + Send + 'static,
        F: for<'a> Fn(&'a mut TypedStageContext<'a, S>, In, St) -> BoxFuture<'a, StageResult<()>> + Send + Sync + 'static,
    {
        let index = self.stages.len();
        let stage_id = self.stage_id_for(index);
        let next_stage_id = Some(self.next_stage_id(index));
        let dispatch = make_dispatch(self.serializer.clone(), processor);
        let stage = Stage::new(
            stage_id,
            next_stage_id,
            dispatch,
            self.collaborators.session_factory.clone(),
            self.collaborators.db.clone(),
            self.collaborators.codec.clone(),
            config,
            self.collaborators.default_concurrency,
            self.collaborators.db_breaker.clone(),
            self.collaborators.broker_breaker.clone(),
        );
        self.stages.push(stage);
        self
    }

    /// Appends the terminal stage and finalizes the endpoint. The
    /// return-lambda's `Result` value (if `Some`) is sugar for `reply`
    /// (spec §4.6); a pure terminator passes a processor that never
    /// replies and declares `Reply = ()`.
    pub fn last_stage<In, St, Re, F>(mut self, config: StageConfig, processor: F) -> Endpoint
    where
        In: DeserializeOwned + Send + 'static,
        St: DeserializeOwned + Default + Send + 'static,
        Re: Serialize + Send + 'static,
        F: for<'a> Fn(&'a mut TypedStageContext<'a, S>, In, St) -> BoxFuture<'a, StageResult<Option<Re>>> + Send + Sync + 'static,
    {
        let index = self.stages.len();
        let stage_id = self.stage_id_for(index);
        let serializer = self.serializer.clone();
        let dispatch = make_dispatch(serializer.clone(), move |ctx: &mut TypedStageContext<'_, S>, incoming: In, state: St| {
            Box::pin(async move {
                if let Some(reply) = processor(ctx, incoming, state).await? {
                    ctx.reply(&reply, "")?;
                }
                Ok(())
            })
        });
        let stage = Stage::new(
            stage_id,
            None,
            dispatch,
            self.collaborators.session_factory.clone(),
            self.collaborators.db.clone(),
            self.collaborators.codec.clone(),
            config,
            self.collaborators.default_concurrency,
            self.collaborators.db_breaker.clone(),
            self.collaborators.broker_breaker.clone(),
        );
        self.stages.push(stage);
        Endpoint {
            id: self.id,
            stages: self.stages,
            finalized: true,
        }
    }
}

fn make_dispatch<S, In, St, F>(serializer: Arc<S>, processor: F) -> StageDispatch
where
    S: ValueSerializer + 'static,
    In: DeserializeOwned + Send + 'static,
    St: DeserializeOwned + Default + Send + 'static,
    F: for<'a> Fn(&'a mut TypedStageContext<'a, S>, In, St) -> BoxFuture<'a, StageResult<()>> + Send + Sync + 'static,
{
    let processor = Arc::new(processor);
    Arc::new(move |mut ctx: crate::context::StageContext| {
        let serializer = serializer.clone();
        let processor = processor.clone();
        Box::pin(async move {
            let incoming: In = decode_current_call(&ctx, serializer.as_ref())?;
            let state: St = decode_call_state(&ctx, serializer.as_ref())?;
            let mut typed = TypedStageContext::new(&mut ctx, serializer.as_ref());
            processor(&mut typed, incoming, state).await?;
            Ok(ctx)
        })
    })
}

fn decode_current_call<S: ValueSerializer, T: DeserializeOwned>(ctx: &crate::context::StageContext, serializer: &S) -> StageResult<T> {
    let call = ctx
        .trace()
        .current_call()
        .ok_or_else(|| crate::error::StageError::InvariantViolation("stage invoked with no current call on the trace".into()))?;
    serializer.decode_value(&call.data)
}

/// Decodes the state the *current call* delivers to this stage (spec
/// §3's state blob) — not whatever the stack's top frame happens to
/// hold, since those differ on a REPLY (see [`crate::trace::Call::state`]).
fn decode_call_state<S: ValueSerializer, T: DeserializeOwned + Default>(ctx: &crate::context::StageContext, serializer: &S) -> StageResult<T> {
    match ctx.trace().current_call_state() {
        Some(state) => serializer.decode_value(state),
        None => Ok(T::default()),
    }
}
