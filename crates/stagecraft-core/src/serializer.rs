//! Serializer boundary (spec §4.2). Out of scope for this crate beyond
//! the trait: the concrete codec belongs to the host application (or,
//! for tests, `stagecraft-testkit::JsonSerializer`).

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StageError;
use crate::trace::{EncodedValue, Trace};

/// Encode/decode capability the runtime requires of a payload codec.
///
/// Implementations must be deterministic enough that two processes
/// sharing a schema version can interoperate (spec §4.1 "Encoding
/// semantics"). Errors here are always fatal to the current stage
/// invocation (spec §7.3) — they surface as [`StageError::Serialization`].
pub trait Serializer: Send + Sync {
    fn encode_value<T: Serialize>(&self, value: &T) -> Result<EncodedValue, StageError>;
    fn decode_value<T: DeserializeOwned>(&self, value: &EncodedValue) -> Result<T, StageError>;
    fn encode_trace(&self, trace: &Trace) -> Result<Vec<u8>, StageError>;
    fn decode_trace(&self, bytes: &[u8]) -> Result<Trace, StageError>;
}

/// Object-safe counterpart used wherever the runtime needs to hold a
/// serializer behind a trait object (the concrete `Serializer` above
/// has generic methods and so cannot be made into `dyn Serializer`
/// directly). The runtime's internal plumbing only ever needs to move
/// already-encoded bytes around, so this is the surface that actually
/// gets threaded through `Arc<dyn ...>` call sites.
pub trait TraceCodec: Send + Sync {
    fn encode_trace(&self, trace: &Trace) -> Result<Vec<u8>, StageError>;
    fn decode_trace(&self, bytes: &[u8]) -> Result<Trace, StageError>;
}

impl<S: Serializer> TraceCodec for S {
    fn encode_trace(&self, trace: &Trace) -> Result<Vec<u8>, StageError> {
        Serializer::encode_trace(self, trace)
    }

    fn decode_trace(&self, bytes: &[u8]) -> Result<Trace, StageError> {
        Serializer::decode_trace(self, bytes)
    }
}
