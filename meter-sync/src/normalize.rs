use crate::errors::{Error, Result};
use serde_json::{Map, Value};

/// Key under which some broker messages carry their real, JSON-encoded body.
const CONTENT_FIELD: &str = "content";

pub type Payload = Map<String, Value>;

/// Parses a broker message into a flat-ish JSON object.
///
/// Returns `Ok(None)` for an empty body. A wrapped `content` field (either an
/// object or a JSON string) replaces the envelope. Array and object members
/// not listed in `retained` are dropped: they carry per-channel time series
/// that no capability reads.
pub fn normalize(bytes: &[u8], retained: &[&str]) -> Result<Option<Payload>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Payload(format!("payload is not UTF-8: {}", e)))?;
    if text.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::Payload(format!("invalid JSON: {}", e)))?;
    let mut payload = into_object(value)?;

    if let Some(content) = payload.remove(CONTENT_FIELD) {
        payload = match content {
            Value::String(encoded) => {
                let inner: Value = serde_json::from_str(&encoded)
                    .map_err(|e| Error::Payload(format!("invalid nested content: {}", e)))?;
                into_object(inner)?
            }
            other => into_object(other)?,
        };
    }

    strip_noise(&mut payload, retained);
    Ok(Some(payload))
}

fn into_object(value: Value) -> Result<Payload> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Payload(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn strip_noise(payload: &mut Payload, retained: &[&str]) {
    payload.retain(|key, value| {
        !(value.is_array() || value.is_object()) || retained.contains(&key.as_str())
    });
}
