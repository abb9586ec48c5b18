// ABOUTME: Wire codec between JSON entities and canonical column values
// ABOUTME: Handles exact decimals, the ~t date tag and dropping of unsupported ~ extension tags

use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use serde_json::{Map, Number, Value as JsonValue};

use super::{Entity, Value, DELETED_FIELD};
use crate::error::BridgeError;

/// Prefix shared by all extension-typed strings.
pub const EXTENSION_PREFIX: char = '~';

/// Extension tag for calendar dates, e.g. `~t2024-01-02`.
pub const DATE_TAG: &str = "~t";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Largest decimal exponent accepted on the wire, matching NUMERIC's range.
const MAX_EXPONENT: i64 = 131_072;

/// Result of decoding one wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(Value),
    /// An unsupported extension type; the enclosing field must be dropped.
    Ignore,
}

/// Decode a single field value.
///
/// `field` is only used to make error messages useful.
pub fn decode_value(field: &str, value: &JsonValue) -> Result<Decoded, BridgeError> {
    match value {
        JsonValue::Null => Ok(Decoded::Value(Value::Null)),
        JsonValue::Bool(b) => Ok(Decoded::Value(Value::Bool(*b))),
        JsonValue::Number(n) => decode_number(field, n).map(|d| Decoded::Value(Value::Number(d))),
        JsonValue::String(s) => decode_string(field, s),
        JsonValue::Array(_) => Err(BridgeError::decode(field, "arrays are not supported")),
        JsonValue::Object(_) => Err(BridgeError::decode(field, "objects are not supported")),
    }
}

// The number keeps its literal text (serde_json arbitrary_precision), so no
// binary floating point is involved and every digit survives.
fn decode_number(field: &str, n: &Number) -> Result<BigDecimal, BridgeError> {
    let text = n.to_string();
    let number = BigDecimal::from_str(&text)
        .map_err(|e| BridgeError::decode(field, format!("invalid number {}: {}", text, e)))?;

    let (_, scale) = number.as_bigint_and_exponent();
    if scale.abs() > MAX_EXPONENT {
        return Err(BridgeError::decode(
            field,
            format!("number {} is out of range", text),
        ));
    }
    if number.is_zero() && scale < 0 {
        return Ok(number.with_scale(0));
    }
    Ok(number)
}

fn decode_string(field: &str, s: &str) -> Result<Decoded, BridgeError> {
    if let Some(date) = s.strip_prefix(DATE_TAG) {
        let parsed = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|e| {
            BridgeError::decode(field, format!("invalid date '{}': {}", date, e))
        })?;
        Ok(Decoded::Value(Value::Date(parsed)))
    } else if s.starts_with(EXTENSION_PREFIX) {
        Ok(Decoded::Ignore)
    } else {
        Ok(Decoded::Value(Value::String(s.to_string())))
    }
}

/// Decode one entity object. Fields carrying unsupported extension values are dropped.
pub fn decode_entity(value: JsonValue) -> Result<Entity, BridgeError> {
    let JsonValue::Object(object) = value else {
        return Err(BridgeError::decode(
            "<entity>",
            format!("expected a JSON object, got {}", json_kind(&value)),
        ));
    };

    let mut entity = Entity::new();
    for (name, value) in object {
        if name == DELETED_FIELD {
            match value {
                JsonValue::Bool(deleted) => entity.set_deleted(deleted),
                other => {
                    return Err(BridgeError::decode(
                        DELETED_FIELD,
                        format!("expected a boolean, got {}", json_kind(&other)),
                    ))
                }
            }
            continue;
        }
        match decode_value(&name, &value)? {
            Decoded::Value(v) => entity.insert(name, v),
            Decoded::Ignore => {
                tracing::trace!("Dropping field '{}' with unsupported extension value", name)
            }
        }
    }
    Ok(entity)
}

/// Decode a batch body. The top level must be an array; elements are decoded
/// lazily so a bad entity only surfaces when the writer reaches it.
pub fn decode_entities(
    body: JsonValue,
) -> Result<impl Iterator<Item = Result<Entity, BridgeError>>, BridgeError> {
    match body {
        JsonValue::Array(items) => Ok(items.into_iter().map(decode_entity)),
        other => Err(BridgeError::decode(
            "<batch>",
            format!("expected a JSON array, got {}", json_kind(&other)),
        )),
    }
}

pub fn encode_value(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(d) => {
            let text = d.to_plain_string();
            match Number::from_str(&text) {
                Ok(n) => JsonValue::Number(n),
                Err(_) => JsonValue::String(text),
            }
        }
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Date(d) => JsonValue::String(format!("{}{}", DATE_TAG, d.format(DATE_FORMAT))),
    }
}

pub fn encode_entity(entity: &Entity) -> JsonValue {
    let mut object = Map::with_capacity(entity.len() + 1);
    for (name, value) in entity.fields() {
        object.insert(name.to_string(), encode_value(value));
    }
    if entity.is_deleted() {
        object.insert(DELETED_FIELD.to_string(), JsonValue::Bool(true));
    }
    JsonValue::Object(object)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
