//! Truthiness and string coercion.

use super::eval::Value;

/// Coerces a value to a boolean. Empty string, zero, empty collection
/// and null are false.
pub fn coerce_bool(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Float(n) => *n != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Json(serde_json::Value::Array(items)) => !items.is_empty(),
        Value::Json(serde_json::Value::Object(map)) => !map.is_empty(),
        Value::Json(_) => true,
    }
}

/// Coerces a value to a string. Null renders empty.
pub fn coerce_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Str(s) => s.clone(),
        Value::Json(serde_json::Value::Array(items)) if items.is_empty() => String::new(),
        Value::Json(serde_json::Value::Object(map)) if map.is_empty() => String::new(),
        Value::Json(other) => other.to_string(),
    }
}
