//! Core type system for validation
//!
//! This module defines the runtime values flowing through the validator and
//! the type descriptors they are checked against.

use crate::model::ModelSchema;
use base64::Engine;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use std::sync::Arc;

// ============================================================================
// Value Enum - Runtime values to be validated
// ============================================================================

/// Runtime value that can be validated
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (i64)
    Int(i64),
    /// Float value (f64)
    Float(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timezone-aware timestamp
    DateTime(DateTime<FixedOffset>),
    /// List/Array of values
    List(Vec<Value>),
    /// Object/Dictionary (key-value pairs, insertion ordered)
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Get human-readable type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::DateTime(_) => "datetime",
            Self::List(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            Self::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Object(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Look up a key on an object value. Returns `None` for non-objects.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object()
            .and_then(|pairs| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }

    /// Convert to a `serde_json::Value`.
    ///
    /// Datetimes become ISO-8601 strings and bytes become standard base64.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ),
            Value::DateTime(dt) => {
                serde_json::Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(pairs) => serde_json::Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json()
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Value::DateTime(dt)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt.fixed_offset())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// TypeDescriptor - Type definitions for validation
// ============================================================================

/// Target type of a field or parameter.
///
/// Coercion is driven by this descriptor; constraints are attached separately
/// on the field so that they can be checked in declaration order.
#[derive(Debug, Clone)]
pub enum TypeDescriptor {
    /// UTF-8 string
    String,
    /// 64-bit signed integer
    Int,
    /// 64-bit float
    Float,
    /// Boolean
    Bool,
    /// Raw bytes
    Bytes,
    /// Timezone-aware datetime (naive input is taken as UTC)
    DateTime,
    /// Homogeneous list
    List(Box<TypeDescriptor>),
    /// Nested model
    Model(Arc<ModelSchema>),
    /// Nullable wrapper
    Optional(Box<TypeDescriptor>),
    /// Anything, passed through untouched
    Any,
}

impl TypeDescriptor {
    /// Shorthand for `List(Box::new(items))`.
    pub fn list(items: TypeDescriptor) -> Self {
        Self::List(Box::new(items))
    }

    /// Shorthand for `Optional(Box::new(inner))`.
    pub fn optional(inner: TypeDescriptor) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// Get human-readable type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "integer",
            Self::Float => "float",
            Self::Bool => "boolean",
            Self::Bytes => "bytes",
            Self::DateTime => "datetime",
            Self::List(_) => "list",
            Self::Model(_) => "object",
            Self::Optional(inner) => inner.type_name(),
            Self::Any => "any",
        }
    }

    /// Whether the descriptor accepts several raw occurrences (repeated query keys).
    pub fn is_sequence(&self) -> bool {
        match self {
            Self::List(_) => true,
            Self::Optional(inner) => inner.is_sequence(),
            _ => false,
        }
    }
}
