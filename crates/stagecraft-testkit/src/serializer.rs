//! The reference/test [`Serializer`] implementation: JSON via
//! `serde_json`. Good enough to exercise every invariant in
//! `stagecraft-core`; a production host application is free to swap in
//! any other codec that implements the same trait.

use serde::de::DeserializeOwned;
use serde::Serialize;
use stagecraft_core::error::StageError;
use stagecraft_core::serializer::Serializer;
use stagecraft_core::trace::{EncodedValue, Trace};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode_value<T: Serialize>(&self, value: &T) -> Result<EncodedValue, StageError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StageError::serialization(e.to_string()))?;
        Ok(EncodedValue::new(bytes, std::any::type_name::<T>()))
    }

    fn decode_value<T: DeserializeOwned>(&self, value: &EncodedValue) -> Result<T, StageError> {
        serde_json::from_slice(&value.bytes).map_err(|e| StageError::serialization(e.to_string()))
    }

    fn encode_trace(&self, trace: &Trace) -> Result<Vec<u8>, StageError> {
        serde_json::to_vec(trace).map_err(|e| StageError::serialization(e.to_string()))
    }

    fn decode_trace(&self, bytes: &[u8]) -> Result<Trace, StageError> {
        serde_json::from_slice(bytes).map_err(|e| StageError::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        n: i32,
        s: String,
    }

    #[test]
    fn value_round_trips() {
        let serializer = JsonSerializer;
        let value = Payload { n: 42, s: "A".into() };
        let encoded = serializer.encode_value(&value).unwrap();
        let decoded: Payload = serializer.decode_value(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn trace_round_trips() {
        let serializer = JsonSerializer;
        let trace = Trace::new_send("t1", "a", "b", EncodedValue::new(b"x".to_vec(), "test"));
        let bytes = serializer.encode_trace(&trace).unwrap();
        let decoded = serializer.decode_trace(&bytes).unwrap();
        assert_eq!(decoded.trace_id(), trace.trace_id());
        assert_eq!(decoded.hop_count(), trace.hop_count());
    }
}
