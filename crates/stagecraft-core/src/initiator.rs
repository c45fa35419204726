//! The initiator (spec §4.8): a zero-stage producer that starts a flow
//! from outside any stage. Each [`Initiator::initiate`] call runs inside
//! its own BE-1PC transaction scope — like a stage invocation — but its
//! outgoing builder allows any number of `request`/`send` calls rather
//! than a stage's at-most-one (spec §4.8: "multiple sends in one scope
//! share the transaction"); there is no existing stack frame to pop, so
//! `reply`/`next` are not part of this surface.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;

use crate::broker::BrokerSessionFactory;
use crate::context::Outgoing;
use crate::coordinator::TransactionCoordinator;
use crate::db::DbConnectionSupplier;
use crate::error::{BrokerOp, StageError, StageResult};
use crate::resilience::CircuitBreakerBehavior;
use crate::serializer::{Serializer as ValueSerializer, TraceCodec};
use crate::trace::{EncodedValue, Trace};

/// Untyped outgoing-message accumulator for one initiate scope.
#[derive(Debug, Default)]
pub struct InitiateContext {
    outgoing: Vec<Outgoing>,
}

impl InitiateContext {
    fn new() -> Self {
        Self::default()
    }

    /// Starts a flow that expects a reply; pushes the first stack frame.
    pub fn request(
        &mut self,
        trace_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        data: EncodedValue,
        reply_to: impl Into<String>,
        initial_state: EncodedValue,
    ) {
        let to = to.into();
        let trace = Trace::new_request(trace_id, from, to.clone(), data, reply_to, initial_state);
        self.outgoing.push(Outgoing { queue_id: to, trace });
    }

    /// Fire-and-forget; no reply is ever expected of the destination.
    pub fn send(&mut self, trace_id: impl Into<String>, from: impl Into<String>, to: impl Into<String>, data: EncodedValue) {
        let to = to.into();
        let trace = Trace::new_send(trace_id, from, to.clone(), data);
        self.outgoing.push(Outgoing { queue_id: to, trace });
    }

    fn into_outgoing(self) -> Vec<Outgoing> {
        self.outgoing
    }
}

/// Ergonomic, serializer-aware wrapper handed to the closure passed to
/// [`Initiator::initiate`]. Every outgoing message is addressed `from`
/// the initiator's own id.
pub struct TypedInitiateContext<'a, S: ValueSerializer> {
    inner: &'a mut InitiateContext,
    serializer: &'a S,
    from: String,
}

impl<'a, S: ValueSerializer> TypedInitiateContext<'a, S> {
    fn new(inner: &'a mut InitiateContext, serializer: &'a S, from: impl Into<String>) -> Self {
        Self {
            inner,
            serializer,
            from: from.into(),
        }
    }

    pub fn request<T: serde::Serialize, St: serde::Serialize>(
        &mut self,
        trace_id: impl Into<String>,
        to: impl Into<String>,
        data: &T,
        reply_to: impl Into<String>,
        initial_state: &St,
    ) -> StageResult<()> {
        let data = self.serializer.encode_value(data)?;
        let state = self.serializer.encode_value(initial_state)?;
        self.inner.request(trace_id, self.from.clone(), to, data, reply_to, state);
        Ok(())
    }

    pub fn send<T: serde::Serialize>(&mut self, trace_id: impl Into<String>, to: impl Into<String>, data: &T) -> StageResult<()> {
        let data = self.serializer.encode_value(data)?;
        self.inner.send(trace_id, self.from.clone(), to, data);
        Ok(())
    }
}

/// The entry point for starting a flow from outside any stage (spec
/// §4.8). Transactional like a stage: each `initiate` call opens its
/// own broker session and BE-1PC scope, commits every message it sent,
/// or rolls back all of them on any error.
pub struct Initiator<S: ValueSerializer + 'static> {
    id: String,
    serializer: Arc<S>,
    session_factory: Arc<dyn BrokerSessionFactory>,
    db: Arc<dyn DbConnectionSupplier>,
    db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
}

impl<S: ValueSerializer + 'static> std::fmt::Debug for Initiator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initiator").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<S: ValueSerializer + 'static> Initiator<S> {
    pub(crate) fn new(
        id: impl Into<String>,
        serializer: Arc<S>,
        session_factory: Arc<dyn BrokerSessionFactory>,
        db: Arc<dyn DbConnectionSupplier>,
        db_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
        broker_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
    ) -> Self {
        Self {
            id: id.into(),
            serializer,
            session_factory,
            db,
            db_breaker,
            broker_breaker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs `body` inside one transactional scope. `body` may call
    /// `request`/`send` any number of times; all resulting messages
    /// commit together, or none do.
    pub async fn initiate<F>(&self, body: F) -> StageResult<()>
    where
        F: for<'r> FnOnce(&mut TypedInitiateContext<'r, S>) -> StageResult<()> + Send + 'static,
    {
        let session = self
            .session_factory
            .open_session()
            .await
            .map_err(|e| StageError::broker(BrokerOp::Send, e))?;
        let coordinator =
            TransactionCoordinator::new(session.clone(), self.db.clone()).with_breakers(self.db_breaker.clone(), self.broker_breaker.clone());
        let serializer = self.serializer.clone();
        let codec: Arc<dyn TraceCodec> = serializer.clone() as Arc<dyn TraceCodec>;
        let from = self.id.clone();
        let send_session = session.clone();

        let result = coordinator
            .run_scope(move |_handle| {
                let serializer = serializer.clone();
                let codec = codec.clone();
                let session = send_session.clone();
                let from = from.clone();
                async move {
                    let mut ctx = InitiateContext::new();
                    {
                        let mut typed = TypedInitiateContext::new(&mut ctx, serializer.as_ref(), from);
                        body(&mut typed)?;
                    }
                    for out in ctx.into_outgoing() {
                        let encoded = codec.encode_trace(&out.trace)?;
                        let mut headers = HashMap::new();
                        headers.insert("trace_id".to_string(), out.trace.trace_id().to_string());
                        headers.insert("message_id".to_string(), uuid::Uuid::new_v4().to_string());
                        session
                            .send(&out.queue_id, encoded, headers)
                            .await
                            .map_err(|e| StageError::broker(BrokerOp::Send, e))?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await;

        if let Err(e) = session.close().await {
            tracing::warn!(initiator = %self.id, error = %e, "failed to close broker session after initiate");
        }

        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(s: &str) -> EncodedValue {
        EncodedValue::new(s.as_bytes().to_vec(), "test")
    }

    #[test]
    fn request_pushes_a_frame_addressed_to_reply_to() {
        let mut ctx = InitiateContext::new();
        ctx.request("t1", "init", "Service", enc("in"), "Terminator", enc("state"));
        let outgoing = ctx.into_outgoing();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].trace.stack_frames().len(), 1);
        assert_eq!(outgoing[0].trace.top_frame().unwrap().reply_to, "Terminator");
    }

    #[test]
    fn multiple_sends_accumulate_in_one_scope() {
        let mut ctx = InitiateContext::new();
        ctx.send("t1", "init", "A", enc("x"));
        ctx.send("t2", "init", "B", enc("y"));
        assert_eq!(ctx.into_outgoing().len(), 2);
    }
}
