//! Salesforce field value representation used across the retrieval,
//! resolver, and engine layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Salesforce record id: 15 or 18 characters, base-62. Kept as a
/// distinct newtype (not a bare `String`) so lookup rewriting and
/// reconciliation code cannot accidentally compare an id against an
/// arbitrary string field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(s: impl Into<String>) -> Self {
        RecordId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(s)
    }
}

/// A value held in a record field, used for transform inputs/outputs and
/// for the content-hash reconciliation in the Bulk v2 engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Id(RecordId),
    /// Picklist / multi-picklist value, stored as its label text.
    Picklist(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Picklist(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<&RecordId> {
        match self {
            Value::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Convert to JSON for an outbound REST/Bulk-v1 record body.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::json!(*i),
            Value::Float(f) => serde_json::json!(*f),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Id(id) => serde_json::Value::String(id.0.clone()),
            Value::Picklist(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Parse a raw JSON value from a query result into a typed `Value`.
    /// Without field metadata we cannot tell an id-shaped string from an
    /// ordinary string or a picklist label, so this purposefully returns
    /// `Value::String` for any string payload; callers with metadata
    /// should prefer [`Value::from_json_typed`].
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Value::DateTime(dt.with_timezone(&Utc));
                }
                Value::String(s.clone())
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Value::String(json.to_string())
            }
        }
    }

    /// Parse a raw CSV cell into a typed value using the same
    /// precedence the bulk CSV repair and write-preview paths use:
    /// bool, then int, then float, then id-shape, then datetime, else string.
    pub fn from_csv_cell(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Value::Null;
        }
        match s.to_ascii_lowercase().as_str() {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = s.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return Value::Float(f);
        }
        if is_salesforce_id_shape(s) {
            return Value::Id(RecordId::new(s));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Value::DateTime(dt.with_timezone(&Utc));
        }
        Value::String(s.to_string())
    }
}

/// A Salesforce id is 15 or 18 alphanumeric characters. This is a shape
/// heuristic, not a checksum validation (the 18-char suffix is a
/// case-encoding checksum the platform computes; we do not recompute it).
pub fn is_salesforce_id_shape(s: &str) -> bool {
    (s.len() == 15 || s.len() == 18) && s.chars().all(|c| c.is_ascii_alphanumeric())
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::String(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(fl) => write!(f, "{fl}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Id(id) => write!(f, "{id}"),
            Value::Picklist(s) => write!(f, "{s}"),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}
