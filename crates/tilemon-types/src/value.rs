//! Attribute values, read qualities and cache snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// A monitored attribute value as reported by the hardware.
///
/// The representation is JSON-shaped so the rack boards' HTTP payloads and
/// TOML configuration map onto it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Numeric view of the value. Booleans and text are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            AttributeValue::Int(0) => Some(false),
            AttributeValue::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Element `index` of a list value.
    pub fn get(&self, index: usize) -> Option<&AttributeValue> {
        match self {
            AttributeValue::List(items) => items.get(index),
            _ => None,
        }
    }

    /// `true` when `other` differs from `self` by more than `epsilon`.
    ///
    /// Numbers compare by absolute difference, lists element-wise, anything
    /// else by equality.
    pub fn differs_beyond(&self, other: &AttributeValue, epsilon: f64) -> bool {
        match (self, other) {
            (AttributeValue::List(a), AttributeValue::List(b)) => {
                a.len() != b.len()
                    || a.iter().zip(b).any(|(x, y)| x.differs_beyond(y, epsilon))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() > epsilon,
                _ => self != other,
            },
        }
    }

    /// Parse a JSON value. `null` and objects have no attribute form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null | serde_json::Value::Object(_) => None,
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Bool(v) => serde_json::Value::Bool(*v),
            AttributeValue::Int(v) => serde_json::Value::from(*v),
            AttributeValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::Text(v) => serde_json::Value::String(v.clone()),
            AttributeValue::List(items) => {
                serde_json::Value::Array(items.iter().map(AttributeValue::to_json).collect())
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Text(v) => write!(f, "{v}"),
            AttributeValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// Freshness of a cached attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Read within `polling_period + grace`.
    Fresh,
    /// Overdue, or the last read attempt failed.
    Stale,
    /// Never read, unsupported by this hardware variant, or the device is
    /// unreachable.
    Invalid,
}

/// Result of a single `get_attribute` call on the hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeReading {
    pub value: AttributeValue,
    pub quality: Quality,
}

impl AttributeReading {
    pub fn fresh(value: impl Into<AttributeValue>) -> Self {
        Self {
            value: value.into(),
            quality: Quality::Fresh,
        }
    }
}

/// A cache entry as handed to readers, annotated at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub value: Option<AttributeValue>,
    pub quality: Quality,
    /// Wall-clock time of the last successful read.
    pub updated_at: Option<DateTime<Utc>>,
    /// Age of the value at the moment it was read from the cache.
    pub age: Option<Duration>,
    pub polling_period: Duration,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        self.quality == Quality::Fresh && self.value.is_some()
    }

    /// The value, only when it is fresh.
    pub fn fresh_value(&self) -> Option<&AttributeValue> {
        if self.quality == Quality::Fresh {
            self.value.as_ref()
        } else {
            None
        }
    }
}

/// Point-in-time view of one device's cache partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: DeviceId,
    /// Liveness flag of the endpoint.
    pub online: bool,
    /// Set once consecutive poll failures reach the escalation threshold.
    pub comm_fault: Option<String>,
    pub entries: BTreeMap<String, CacheEntry>,
}

impl DeviceSnapshot {
    pub fn entry(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    pub fn fresh_value(&self, name: &str) -> Option<&AttributeValue> {
        self.entries.get(name).and_then(CacheEntry::fresh_value)
    }

    pub fn fresh_bool(&self, name: &str) -> Option<bool> {
        self.fresh_value(name).and_then(AttributeValue::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_with_epsilon() {
        let a = AttributeValue::Float(45.0);
        assert!(!a.differs_beyond(&AttributeValue::Float(45.4), 0.5));
        assert!(a.differs_beyond(&AttributeValue::Float(45.6), 0.5));
        // Int and Float share the numeric view.
        assert!(!AttributeValue::Int(45).differs_beyond(&a, 0.0));
    }

    #[test]
    fn lists_compare_element_wise() {
        let a = AttributeValue::List(vec![true.into(), false.into()]);
        let b = AttributeValue::List(vec![true.into(), true.into()]);
        assert!(a.differs_beyond(&b, 0.0));
        assert!(!a.differs_beyond(&a.clone(), 0.0));
        assert!(a.differs_beyond(&AttributeValue::List(vec![true.into()]), 10.0));
    }

    #[test]
    fn text_compares_by_equality() {
        let on = AttributeValue::from("ON");
        assert!(on.differs_beyond(&AttributeValue::from("OFF"), 100.0));
    }

    #[test]
    fn json_values_map_onto_variants() {
        let v = serde_json::json!([1, 2.5, "x", true]);
        let parsed = AttributeValue::from_json(&v).unwrap();
        assert_eq!(
            parsed,
            AttributeValue::List(vec![
                AttributeValue::Int(1),
                AttributeValue::Float(2.5),
                AttributeValue::Text("x".into()),
                AttributeValue::Bool(true),
            ])
        );
        assert_eq!(parsed.to_json(), v);
        assert!(AttributeValue::from_json(&serde_json::Value::Null).is_none());
    }

    #[test]
    fn stale_entry_hides_its_value() {
        let entry = CacheEntry {
            name: "board_temperature".into(),
            value: Some(AttributeValue::Float(50.0)),
            quality: Quality::Stale,
            updated_at: None,
            age: Some(Duration::from_secs(9)),
            polling_period: Duration::from_secs(1),
        };
        assert!(!entry.is_fresh());
        assert!(entry.fresh_value().is_none());
    }
}
