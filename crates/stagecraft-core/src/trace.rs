//! The flow envelope: call chain, stack-of-returns, properties, and
//! single-hop sideband payloads. Every hop through the system reads one
//! `Trace` and produces the next; `Trace` itself never does I/O — all
//! operations here are pure and produce new values (or read existing
//! ones), per spec §4.1.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An opaque, serializer-produced payload plus the type name it was
/// encoded from. The type name is informational only (§3's "declared
/// class name"); decoding is always driven by the receiver's requested
/// type, never by reflecting on this field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub bytes: Vec<u8>,
    pub class_name: String,
}

impl EncodedValue {
    pub fn new(bytes: Vec<u8>, class_name: impl Into<String>) -> Self {
        Self {
            bytes,
            class_name: class_name.into(),
        }
    }
}

/// The kind of hop a [`Call`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Pushes a stack frame; a reply is expected eventually.
    Request,
    /// Pops a stack frame; addressed to the popped frame's `reply_to`.
    Reply,
    /// Neither pushes nor pops; stays within the same logical caller.
    Next,
    /// Neither pushes nor pops; fire-and-forget, no stack involvement.
    Send,
}

/// One hop in the flow's call chain. `calls` is append-only: after `N`
/// hops, `trace.calls.len() == N`.
///
/// `state` is the value the *destination* stage should decode as its
/// own incoming state, `None` when the destination has none. It is not
/// simply "whatever is on top of the stack now" — on a REPLY that value
/// lives in the frame that was just popped, not the one left behind
/// (which belongs to an outer, still-waiting caller), so it travels
/// with the call itself rather than being re-derived from
/// `stack_frames` on arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_type: CallType,
    pub from: String,
    pub to: String,
    pub data: EncodedValue,
    pub state: Option<EncodedValue>,
}

/// One LIFO "return address" entry. `replyTo` records who gets the
/// eventual `Reply`; `state` is the caller's own frame-local state,
/// opaque to everyone but the endpoint that owns the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    pub reply_to: String,
    pub state: EncodedValue,
}

/// A named, dynamically-scoped value that propagates forward through
/// the whole flow once set. Last write along the flow wins (spec §3).
pub type Properties = HashMap<String, EncodedValue>;

/// The in-flight envelope. See spec §3 for the full invariant list;
/// the short version: `calls` only grows, `stack_frames` is a real
/// stack driven by call type, `properties` persist across the whole
/// flow, and `binaries`/`strings` live for exactly one hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    trace_id: String,
    calls: Vec<Call>,
    stack_frames: Vec<StackFrame>,
    properties: Properties,
    binaries: HashMap<String, Vec<u8>>,
    strings: HashMap<String, String>,
}

impl Trace {
    /// Start a flow with a single SEND call (no stack depth) — used by
    /// an [`crate::initiator::Initiator`] sending to a terminator.
    pub fn new_send(trace_id: impl Into<String>, from: impl Into<String>, to: impl Into<String>, data: EncodedValue) -> Self {
        let mut trace = Self::bare(trace_id);
        trace.calls.push(Call {
            call_type: CallType::Send,
            from: from.into(),
            to: to.into(),
            data,
            state: None,
        });
        trace
    }

    /// Start a flow with a single REQUEST call — one stack frame is
    /// pushed so a reply can eventually find its way back to `reply_to`.
    /// The freshly-entered destination starts with no incoming state of
    /// its own; `initial_state` is only delivered later, to `reply_to`,
    /// when the matching REPLY unwinds this frame.
    pub fn new_request(
        trace_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        data: EncodedValue,
        reply_to: impl Into<String>,
        initial_state: EncodedValue,
    ) -> Self {
        let mut trace = Self::bare(trace_id);
        trace.stack_frames.push(StackFrame {
            reply_to: reply_to.into(),
            state: initial_state,
        });
        trace.calls.push(Call {
            call_type: CallType::Request,
            from: from.into(),
            to: to.into(),
            data,
            state: None,
        });
        trace
    }

    fn bare(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            calls: Vec::new(),
            stack_frames: Vec::new(),
            properties: HashMap::new(),
            binaries: HashMap::new(),
            strings: HashMap::new(),
        }
    }

    /// `traceId` is immutable along the flow except by append — this is
    /// the only way to grow it, matching §3's "outgoing traceId equals
    /// incoming + user-supplied suffix".
    pub fn with_appended_trace_id(&self, suffix: &str) -> String {
        format!("{}{}", self.trace_id, suffix)
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn hop_count(&self) -> usize {
        self.calls.len()
    }

    pub fn current_call(&self) -> Option<&Call> {
        self.calls.last()
    }

    /// The state the stage about to process this trace should decode as
    /// its own — see [`Call::state`]. `None` means "use the endpoint's
    /// zero/default state".
    pub fn current_call_state(&self) -> Option<&EncodedValue> {
        self.calls.last().and_then(|call| call.state.as_ref())
    }

    pub fn stack_frames(&self) -> &[StackFrame] {
        &self.stack_frames
    }

    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.stack_frames.last()
    }

    /// True when the current call has no stack frame to fall back on —
    /// a reply here would be a no-op per §3's REPLY contract.
    pub fn is_terminal_call(&self) -> bool {
        self.stack_frames.is_empty()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn get_property(&self, key: &str) -> Option<&EncodedValue> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: EncodedValue) {
        self.properties.insert(key.into(), value);
    }

    pub fn get_binary(&self, key: &str) -> Option<&[u8]> {
        self.binaries.get(key).map(|v| v.as_slice())
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(|s| s.as_str())
    }

    /// Append a REQUEST call: pushes `{reply_to, callerNextState}` and
    /// records the hop. Returns a new `Trace` (builder-style, to make
    /// the at-most-one-outgoing invariant easy to enforce at the call
    /// site — see spec §9).
    ///
    /// `caller_next_state` is *not* handed to the callee: it seeds the
    /// pushed frame, to be delivered back to `reply_to` once the callee
    /// (eventually) replies. The callee's first stage always starts
    /// from its endpoint's zero/default state.
    #[must_use]
    pub fn add_call_request(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: EncodedValue,
        reply_to: impl Into<String>,
        caller_next_state: EncodedValue,
        trace_id_suffix: &str,
    ) -> Self {
        self.trace_id.push_str(trace_id_suffix);
        self.stack_frames.push(StackFrame {
            reply_to: reply_to.into(),
            state: caller_next_state,
        });
        self.calls.push(Call {
            call_type: CallType::Request,
            from: from.into(),
            to: to.into(),
            data,
            state: None,
        });
        self.clear_sideband();
        self
    }

    /// Append a REPLY call: requires a non-empty stack, pops the top
    /// frame, and addresses the call to the popped frame's `reply_to`,
    /// carrying the popped frame's state along so the destination can
    /// decode it as its own. Returns `None` if the stack is empty — the
    /// REPLY contract's silent no-op (spec §3, §4.5).
    #[must_use]
    pub fn add_call_reply(mut self, from: impl Into<String>, data: EncodedValue, trace_id_suffix: &str) -> Option<Self> {
        let frame = self.stack_frames.pop()?;
        self.trace_id.push_str(trace_id_suffix);
        self.calls.push(Call {
            call_type: CallType::Reply,
            from: from.into(),
            to: frame.reply_to,
            data,
            state: Some(frame.state),
        });
        self.clear_sideband();
        Some(self)
    }

    /// Append a NEXT call: no stack change in depth, but the top
    /// frame's state is replaced with the stage's current state, which
    /// also rides along on the call for the next stage to decode.
    #[must_use]
    pub fn add_call_next(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        data: EncodedValue,
        same_frame_state: EncodedValue,
        trace_id_suffix: &str,
    ) -> Self {
        self.trace_id.push_str(trace_id_suffix);
        if let Some(frame) = self.stack_frames.last_mut() {
            frame.state = same_frame_state.clone();
        }
        self.calls.push(Call {
            call_type: CallType::Next,
            from: from.into(),
            to: to.into(),
            data,
            state: Some(same_frame_state),
        });
        self.clear_sideband();
        self
    }

    /// Append a SEND call: no stack interaction at all.
    #[must_use]
    pub fn add_call_send(mut self, from: impl Into<String>, to: impl Into<String>, data: EncodedValue, trace_id_suffix: &str) -> Self {
        self.trace_id.push_str(trace_id_suffix);
        self.calls.push(Call {
            call_type: CallType::Send,
            from: from.into(),
            to: to.into(),
            data,
            state: None,
        });
        self.clear_sideband();
        self
    }

    /// Outgoing `binaries`/`strings` are exactly what the current stage
    /// adds via its [`crate::context::StageContext`] — never inherited.
    fn clear_sideband(&mut self) {
        self.binaries.clear();
        self.strings.clear();
    }

    pub fn set_binary(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.binaries.insert(key.into(), value);
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: String) {
        self.strings.insert(key.into(), value);
    }
}
