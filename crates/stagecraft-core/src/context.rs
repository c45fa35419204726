//! The outgoing-message builder exposed to a running stage or initiator
//! (spec §4.5's "Context", §4.8's initiator builder). `StageContext` is
//! the untyped, non-generic surface the runtime itself manipulates;
//! [`TypedStageContext`] is the ergonomic generic wrapper a processor
//! lambda actually sees, built fresh per invocation by the stage's
//! type-erased dispatch closure (which is the only place a concrete
//! `Serializer` is in scope — see `crate::endpoint`).

use std::sync::Arc;

use crate::coordinator::ScopeHandle;
use crate::db::DbConnection;
use crate::error::{StageError, StageResult};
use crate::serializer::Serializer;
use crate::trace::{EncodedValue, Trace};

/// One message this scope wants to send: the destination queue id plus
/// the `Trace` to ship, already advanced by the call that produced it.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub queue_id: String,
    pub trace: Trace,
}

/// Untyped dispatch surface. Enforces the at-most-one-of
/// {request, reply, next} invariant (spec §4.5, §8) by tracking a
/// single `Option<Outgoing>` slot: the first successful call occupies
/// it, and any later one is rejected with [`StageError::MultipleOutgoing`]
/// without touching the slot.
#[derive(Debug)]
pub struct StageContext {
    stage_id: String,
    next_stage_id: Option<String>,
    trace: Trace,
    outgoing: Option<Outgoing>,
    initiated: Vec<Outgoing>,
    db: Arc<ScopeHandle>,
}

impl StageContext {
    pub(crate) fn new(stage_id: impl Into<String>, next_stage_id: Option<String>, trace: Trace, db: Arc<ScopeHandle>) -> Self {
        Self {
            stage_id: stage_id.into(),
            next_stage_id,
            trace,
            outgoing: None,
            initiated: Vec::new(),
            db,
        }
    }

    /// Lazily obtains the stage invocation's database connection (spec
    /// §4.4 step 3, §9's "place the lazy connection accessor on the
    /// `ProcessContext`"). The first call is what makes the connection
    /// observable to the coordinator, which then owns commit/rollback.
    pub async fn db_connection(&self) -> StageResult<tokio::sync::MappedMutexGuard<'_, Box<dyn DbConnection>>> {
        self.db.connection().await
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn get_property(&self, key: &str) -> Option<&EncodedValue> {
        self.trace.get_property(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: EncodedValue) {
        self.trace.set_property(key, value);
    }

    pub fn get_binary(&self, key: &str) -> Option<&[u8]> {
        self.trace.get_binary(key)
    }

    pub fn set_binary(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.trace.set_binary(key, value);
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.trace.get_string(key)
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: String) {
        self.trace.set_string(key, value);
    }

    /// `request(target, data)` — legal only when a next stage exists in
    /// this endpoint (spec §4.5). The pushed frame's `replyTo` is always
    /// the *next stage in this endpoint*, never caller-chosen.
    pub fn request(
        &mut self,
        target: impl Into<String>,
        data: EncodedValue,
        caller_next_state: EncodedValue,
        trace_id_suffix: &str,
    ) -> Result<(), StageError> {
        if self.outgoing.is_some() {
            return Err(StageError::MultipleOutgoing);
        }
        let next_stage = self
            .next_stage_id
            .clone()
            .ok_or_else(|| StageError::InvalidDispatch("request() has no following stage in this endpoint".into()))?;
        let new_trace = self.trace.clone().add_call_request(
            self.stage_id.clone(),
            target,
            data,
            next_stage,
            caller_next_state,
            trace_id_suffix,
        );
        let queue_id = new_trace.current_call().expect("just pushed a call").to.clone();
        self.outgoing = Some(Outgoing { queue_id, trace: new_trace });
        Ok(())
    }

    /// `reply(data)` — pops the top frame and addresses the call to its
    /// `replyTo`. A silent no-op when the stack is empty (spec §3, §4.5);
    /// a no-op does not occupy the at-most-one-outgoing slot.
    pub fn reply(&mut self, data: EncodedValue, trace_id_suffix: &str) -> Result<(), StageError> {
        if self.outgoing.is_some() {
            return Err(StageError::MultipleOutgoing);
        }
        match self.trace.clone().add_call_reply(self.stage_id.clone(), data, trace_id_suffix) {
            Some(new_trace) => {
                let queue_id = new_trace.current_call().expect("just pushed a call").to.clone();
                self.outgoing = Some(Outgoing { queue_id, trace: new_trace });
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// `next(data)` — legal only when a following stage exists; state in
    /// the top frame is replaced, stack depth unchanged.
    pub fn next(&mut self, data: EncodedValue, same_frame_state: EncodedValue, trace_id_suffix: &str) -> Result<(), StageError> {
        if self.outgoing.is_some() {
            return Err(StageError::MultipleOutgoing);
        }
        let next_stage = self
            .next_stage_id
            .clone()
            .ok_or_else(|| StageError::InvalidDispatch("next() has no following stage in this endpoint".into()))?;
        let new_trace = self
            .trace
            .clone()
            .add_call_next(self.stage_id.clone(), next_stage.clone(), data, same_frame_state, trace_id_suffix);
        self.outgoing = Some(Outgoing { queue_id: next_stage, trace: new_trace });
        Ok(())
    }

    /// `initiate` — an independent SEND, sharing this scope's broker
    /// transaction but not the at-most-one-outgoing slot (spec §4.5).
    pub fn initiate(&mut self, from: impl Into<String>, to: impl Into<String>, data: EncodedValue) {
        let to = to.into();
        let new_trace = self.trace.clone().add_call_send(from, to.clone(), data, "");
        self.initiated.push(Outgoing { queue_id: to, trace: new_trace });
    }

    /// `initiate`'s REQUEST counterpart (spec §4.5: "a nested builder for
    /// a SEND/REQUEST independent of the current flow"). Starts a brand
    /// new flow with its own stack frame, addressed to `reply_to` — not
    /// this stage's own call stack, which is untouched.
    pub fn initiate_request(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: EncodedValue,
        reply_to: impl Into<String>,
        initial_state: EncodedValue,
    ) {
        let to = to.into();
        let new_trace = self
            .trace
            .clone()
            .add_call_request(from, to.clone(), data, reply_to, initial_state, "");
        self.initiated.push(Outgoing { queue_id: to, trace: new_trace });
    }

    /// Consumes the context, handing the runtime whatever this stage
    /// decided to send: the primary outgoing (if any) and any
    /// independently initiated sends.
    pub(crate) fn into_outgoing(self) -> (Option<Outgoing>, Vec<Outgoing>) {
        (self.outgoing, self.initiated)
    }
}

/// Ergonomic, type-aware wrapper over [`StageContext`] built fresh by a
/// stage's dispatch closure, which is the only place a concrete
/// [`Serializer`] is available (see `crate::endpoint::EndpointBuilder::stage`).
/// `TypedStageContext` itself is generic — that's fine, it is never
/// stored behind a trait object, only ever constructed, used, and
/// dropped within one stage invocation.
pub struct TypedStageContext<'a, S: Serializer> {
    inner: &'a mut StageContext,
    serializer: &'a S,
}

impl<'a, S: Serializer> TypedStageContext<'a, S> {
    pub(crate) fn new(inner: &'a mut StageContext, serializer: &'a S) -> Self {
        Self { inner, serializer }
    }

    pub fn trace(&self) -> &Trace {
        self.inner.trace()
    }

    pub fn get_property<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StageError> {
        self.inner
            .get_property(key)
            .map(|v| self.serializer.decode_value(v))
            .transpose()
    }

    pub fn set_property<T: serde::Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), StageError> {
        let encoded = self.serializer.encode_value(value)?;
        self.inner.set_property(key, encoded);
        Ok(())
    }

    pub fn get_binary(&self, key: &str) -> Option<&[u8]> {
        self.inner.get_binary(key)
    }

    pub fn set_binary(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.inner.set_binary(key, value);
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.inner.get_string(key)
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: String) {
        self.inner.set_string(key, value);
    }

    pub async fn db_connection(&self) -> StageResult<tokio::sync::MappedMutexGuard<'_, Box<dyn DbConnection>>> {
        self.inner.db_connection().await
    }

    pub fn request<T: serde::Serialize, St: serde::Serialize>(
        &mut self,
        target: impl Into<String>,
        data: &T,
        caller_next_state: &St,
        trace_id_suffix: &str,
    ) -> Result<(), StageError> {
        let data = self.serializer.encode_value(data)?;
        let state = self.serializer.encode_value(caller_next_state)?;
        self.inner.request(target, data, state, trace_id_suffix)
    }

    pub fn reply<T: serde::Serialize>(&mut self, data: &T, trace_id_suffix: &str) -> Result<(), StageError> {
        let data = self.serializer.encode_value(data)?;
        self.inner.reply(data, trace_id_suffix)
    }

    pub fn next<T: serde::Serialize, St: serde::Serialize>(
        &mut self,
        data: &T,
        same_frame_state: &St,
        trace_id_suffix: &str,
    ) -> Result<(), StageError> {
        let data = self.serializer.encode_value(data)?;
        let state = self.serializer.encode_value(same_frame_state)?;
        self.inner.next(data, state, trace_id_suffix)
    }

    pub fn initiate<T: serde::Serialize>(&mut self, from: impl Into<String>, to: impl Into<String>, data: &T) -> Result<(), StageError> {
        let data = self.serializer.encode_value(data)?;
        self.inner.initiate(from, to, data);
        Ok(())
    }

    pub fn initiate_request<T: serde::Serialize, St: serde::Serialize>(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: &T,
        reply_to: impl Into<String>,
        initial_state: &St,
    ) -> Result<(), StageError> {
        let data = self.serializer.encode_value(data)?;
        let state = self.serializer.encode_value(initial_state)?;
        self.inner.initiate_request(from, to, data, reply_to, state);
        Ok(())
    }
}
