use super::PayloadCodec;
use crate::error::{NatsError, Result};
use bytes::Bytes;
use serde_json::Value;

/// JSON bodies. Only objects and arrays are accepted as messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        if !value.is_object() && !value.is_array() {
            return Err(NatsError::InvalidJsonPayload);
        }
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(payload)?)
    }
}
