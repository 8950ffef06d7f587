//! Value types for nestdb
//!
//! This module defines:
//! - Value: tagged tree for document fields
//! - Document: the top-level field map of an entity
//!
//! ## Value Model
//!
//! - Null, Bool, Number, String, Date, Bytes, Array, Object
//! - Numbers are IEEE-754 doubles; integers are carried exactly up to 2^53
//! - Dates are milliseconds since the Unix epoch and stay distinct from numbers
//! - Bytes are storable but cannot be indexed
//! - Objects keep their keys sorted, so serialization is deterministic
//!
//! Different variants are never equal, even if they hold the same "value":
//! `Number(5.0) != Date(5)`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level field map of an entity
pub type Document = BTreeMap<String, Value>;

/// Field value inside a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit floating point (IEEE-754)
    Number(f64),
    /// UTF-8 string
    String(String),
    /// Milliseconds since the Unix epoch
    Date(i64),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Array of values
    Array(Vec<Value>),
    /// Object with string keys
    Object(Document),
}

// IEEE-754 float semantics: NaN != NaN, -0.0 == 0.0
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Date(_) => "Date",
            Value::Bytes(_) => "Bytes",
            Value::Array(_) => "Array",
            Value::Object(_) => "Object",
        }
    }

    /// Date value from a millisecond timestamp
    pub fn date(millis: i64) -> Self {
        Value::Date(millis)
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as f64 if this is a Number value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as a slice if this is an Array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get as a map if this is an Object value
    pub fn as_object(&self) -> Option<&Document> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Date as a chrono timestamp, if this is a Date in chrono's range
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(ms) => Utc.timestamp_millis_opt(*ms).single(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(map: Document) -> Self {
        Value::Object(map)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Value {
    fn from(dt: DateTime<Tz>) -> Self {
        Value::Date(dt.timestamp_millis())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Build a [`Document`] from a JSON object literal.
///
/// Non-object JSON yields an empty document.
pub fn document_from_json(json: serde_json::Value) -> Document {
    match Value::from(json) {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_different_types_never_equal() {
        assert_ne!(Value::Number(5.0), Value::Date(5));
        assert_ne!(Value::String("1".into()), Value::Number(1.0));
        assert_ne!(Value::Bytes(b"a".to_vec()), Value::String("a".into()));
    }

    #[test]
    fn test_float_semantics() {
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_eq!(Value::Number(-0.0), Value::Number(0.0));
    }

    #[test]
    fn test_from_json_nested() {
        let doc = document_from_json(json!({"name": "David", "info": {"age": 30, "tags": ["a"]}}));
        assert_eq!(doc.get("name"), Some(&Value::from("David")));
        let info = doc.get("info").and_then(Value::as_object).unwrap();
        assert_eq!(info.get("age"), Some(&Value::Number(30.0)));
        assert_eq!(
            info.get("tags"),
            Some(&Value::Array(vec![Value::from("a")]))
        );
    }

    #[test]
    fn test_from_json_non_object_is_empty() {
        assert!(document_from_json(json!([1, 2])).is_empty());
    }

    #[test]
    fn test_datetime_conversion() {
        let dt = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        let value = Value::from(dt);
        assert_eq!(value, Value::Date(1_700_000_000_123));
        assert_eq!(value.as_datetime(), Some(dt));
    }

    #[test]
    fn test_msgpack_roundtrip_keeps_variants() {
        let mut doc = Document::new();
        doc.insert("when".into(), Value::Date(-1));
        doc.insert("blob".into(), Value::Bytes(vec![0, 1]));
        let bytes = rmp_serde::to_vec(&doc).unwrap();
        let back: Document = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, doc);
    }
}
