//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::error::{Error, ValidationError, ValidationErrorKind};

/// A dynamically-typed column value.
///
/// Entity fields, snapshots and change-set payloads are all expressed
/// in terms of this enum so the engine can diff and hash them without
/// knowing the concrete domain types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values (composite keys, inline to-many references)
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Stable textual form used when hashing identities.
    ///
    /// Integer widths are normalized so a key loaded as `BigInt` hashes
    /// the same as one assigned by the application as `Int`.
    pub fn key_fragment(&self) -> String {
        match self {
            Value::Null => "~null~".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) | Value::Timestamp(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Decimal(s) | Value::Text(s) => s.clone(),
            Value::Bytes(b) => hex(b),
            Value::Uuid(b) => hex(b),
            Value::Json(v) => v.to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::key_fragment)
                .collect::<Vec<_>>()
                .join("~~~"),
        }
    }

    /// Next value of an optimistic-lock version column.
    ///
    /// Integer versions are incremented, timestamp versions take `now_micros`.
    /// A NULL version starts at 1.
    pub fn next_version(&self, now_micros: i64) -> crate::Result<Value> {
        match self {
            Value::Null => Ok(Value::Int(1)),
            Value::Int(v) => Ok(Value::Int(v.saturating_add(1))),
            Value::BigInt(v) => Ok(Value::BigInt(v.saturating_add(1))),
            Value::Timestamp(v) => Ok(Value::Timestamp(now_micros.max(v.saturating_add(1)))),
            other => Err(Error::Validation(ValidationError::new(
                ValidationErrorKind::InvalidMetadata,
                format!(
                    "version column must be an integer or timestamp, found {}",
                    other.type_name()
                ),
            ))),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

// Conversion implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
