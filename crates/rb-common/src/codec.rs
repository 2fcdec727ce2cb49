//! Message Envelope Codec
//!
//! Wire format for queue bodies:
//! - inbound `{"pattern": ..., "data": {...}}`
//! - outbound `{"result": ...}` or `{"results": [...]}`

use serde_json::{Map, Value};
use tracing::debug;

use crate::{BridgeError, Envelope, ReplyEnvelope, Result};

const INVALID_FORMAT: &str = "Invalid message format";

/// Parse a queue body into an [`Envelope`].
///
/// Only the presence of `pattern` and `data` is checked here; the dispatcher
/// owns per-operation field validation.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| BridgeError::MalformedPayload(e.to_string()))?;

    let Value::Object(mut fields) = value else {
        return Err(BridgeError::schema(INVALID_FORMAT));
    };

    let pattern = match fields.remove("pattern") {
        None => return Err(BridgeError::schema(INVALID_FORMAT)),
        Some(Value::String(s)) => s,
        // NestJS clients send `{"cmd": "..."}` style patterns
        Some(other) => other.to_string(),
    };

    let data = match fields.remove("data") {
        None => return Err(BridgeError::schema(INVALID_FORMAT)),
        Some(Value::Object(map)) => map,
        Some(other) => {
            debug!(data_type = crate::json_type_name(&other), "Envelope data is not an object");
            Map::new()
        }
    };

    Ok(Envelope { pattern, data })
}

/// Serialize a reply using the same derive as the HTTP responses
pub fn encode(reply: &ReplyEnvelope) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(reply)
}

/// Parse an HTTP request body into a JSON object.
///
/// Valid JSON that is not an object yields an empty map so that required-field
/// validation reports what is missing.
pub fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Map::new()),
        Err(e) => Err(BridgeError::MalformedPayload(e.to_string())),
    }
}
