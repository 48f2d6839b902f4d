//! Attribute values as they flow from the bus to the telemetry row
//!
//! A polled attribute is either a number or null (communication failure).
//! Compiled attributes hold nested lists, and output columns such as the
//! timestamp carry text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current values of one device node, keyed by attribute name
pub type AttributeValues = BTreeMap<String, Value>;

/// One attribute or column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Not available this cycle
    #[default]
    Null,
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Numeric view of a scalar value. Lists and text are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Multiply every number inside the value; nulls and text pass through
    pub fn scaled(&self, factor: f64) -> Value {
        match self {
            Value::Number(n) => Value::Number(n * factor),
            Value::List(items) => Value::List(items.iter().map(|v| v.scaled(factor)).collect()),
            other => other.clone(),
        }
    }

    /// Render the value into a single CSV/SQL field.
    ///
    /// A top-level null becomes an empty field. Lists are flattened into
    /// space-joined scalars with `null` standing in for missing entries.
    pub fn to_field(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::List(items) => {
                let mut parts = Vec::new();
                flatten_into(items, &mut parts);
                parts.join(" ")
            }
            other => other.to_string(),
        }
    }
}

fn flatten_into(items: &[Value], out: &mut Vec<String>) {
    for item in items {
        match item {
            Value::List(inner) => flatten_into(inner, out),
            Value::Null => out.push("null".to_string()),
            other => out.push(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(_) => write!(f, "{}", self.to_field()),
        }
    }
}

impl From<Option<f64>> for Value {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Value::Null, Value::Number)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}
