//! Payload decoding.

use crate::error::DecodeError;
use serde_json::{Map, Value};
use welcome_messages::Signup;

/// Fields every signup must carry as strings.
pub const REQUIRED_FIELDS: [&str; 2] = ["firstname", "email"];

const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";

/// Decodes a raw payload into a [`Signup`].
///
/// Pure: the same bytes always give the same answer, so a `DecodeError` is
/// never worth retrying.
pub fn decode(raw: &[u8]) -> Result<Signup, DecodeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    let mut value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let fields = value.as_object_mut().ok_or(DecodeError::NotAnObject)?;

    for field in REQUIRED_FIELDS {
        match fields.get(field) {
            None | Some(Value::Null) => return Err(DecodeError::MissingField(field)),
            Some(Value::String(_)) => {}
            Some(_) => return Err(DecodeError::NotAString(field)),
        }
    }
    normalize_idempotency_key(fields);

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Numeric keys keep their decimal text. Any other non-string key is dropped
/// and the record falls back to its log position.
fn normalize_idempotency_key(fields: &mut Map<String, Value>) {
    let normalized = match fields.get(IDEMPOTENCY_KEY_FIELD) {
        None | Some(Value::String(_)) => return,
        Some(Value::Number(n)) => Some(Value::String(n.to_string())),
        Some(_) => None,
    };
    match normalized {
        Some(key) => {
            fields.insert(IDEMPOTENCY_KEY_FIELD.to_string(), key);
        }
        None => {
            fields.remove(IDEMPOTENCY_KEY_FIELD);
        }
    }
}
