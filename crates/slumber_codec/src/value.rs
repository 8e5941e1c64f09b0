//! Dynamic payload value type.

use crate::error::ShapeMismatch;
use crate::timestamp::Timestamp;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

/// The primitive kinds a payload value can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// UTF-8 text.
    Text,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Double,
    /// Boolean.
    Bool,
    /// Instant.
    Timestamp,
    /// Nested string-keyed map.
    Map,
}

impl ValueKind {
    /// Human-readable name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Integer => "integer",
            ValueKind::Double => "double",
            ValueKind::Bool => "bool",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamic payload value.
///
/// Envelope payloads are restricted to these kinds. Identifiers travel as
/// text.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Text string (UTF-8).
    Text(String),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Finite 64-bit float.
    Double(f64),
    /// Boolean value.
    Bool(bool),
    /// Instant with millisecond precision.
    Timestamp(Timestamp),
    /// Nested map with the same value kinds.
    Map(Payload),
}

impl Value {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Integer(_) => ValueKind::Integer,
            Value::Double(_) => ValueKind::Double,
            Value::Bool(_) => ValueKind::Bool,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Get this value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a float.
    ///
    /// Integers widen to floats: peers may legitimately encode a whole
    /// number such as `8.0` hours as an integer.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as a timestamp, if it is one.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&Payload> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Timestamp> for Value {
    fn from(ts: Timestamp) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Payload> for Value {
    fn from(p: Payload) -> Self {
        Value::Map(p)
    }
}

/// A string-keyed map of payload values.
///
/// Keys iterate in byte order, which for equal-length keys matches the
/// canonical wire order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    entries: BTreeMap<String, Value>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Inserts a value only when it is present.
    pub fn insert_opt<V: Into<Value>>(&mut self, key: impl Into<String>, value: Option<V>) {
        if let Some(value) = value {
            self.entries.insert(key.into(), value.into());
        }
    }

    /// Builder form of [`Payload::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Returns true if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the payload has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    fn require(&self, key: &str, expected: ValueKind) -> Result<&Value, ShapeMismatch> {
        self.entries
            .get(key)
            .ok_or_else(|| ShapeMismatch::missing(key, expected))
    }

    fn mismatch(key: &str, expected: ValueKind, found: &Value) -> ShapeMismatch {
        ShapeMismatch::wrong_kind(key, expected, found.kind())
    }

    /// Required text value.
    pub fn require_text(&self, key: &str) -> Result<&str, ShapeMismatch> {
        let value = self.require(key, ValueKind::Text)?;
        value
            .as_text()
            .ok_or_else(|| Self::mismatch(key, ValueKind::Text, value))
    }

    /// Required integer value.
    pub fn require_integer(&self, key: &str) -> Result<i64, ShapeMismatch> {
        let value = self.require(key, ValueKind::Integer)?;
        value
            .as_integer()
            .ok_or_else(|| Self::mismatch(key, ValueKind::Integer, value))
    }

    /// Required float value (integers widen).
    pub fn require_double(&self, key: &str) -> Result<f64, ShapeMismatch> {
        let value = self.require(key, ValueKind::Double)?;
        value
            .as_double()
            .ok_or_else(|| Self::mismatch(key, ValueKind::Double, value))
    }

    /// Required boolean value.
    pub fn require_bool(&self, key: &str) -> Result<bool, ShapeMismatch> {
        let value = self.require(key, ValueKind::Bool)?;
        value
            .as_bool()
            .ok_or_else(|| Self::mismatch(key, ValueKind::Bool, value))
    }

    /// Required timestamp value.
    pub fn require_timestamp(&self, key: &str) -> Result<Timestamp, ShapeMismatch> {
        let value = self.require(key, ValueKind::Timestamp)?;
        value
            .as_timestamp()
            .ok_or_else(|| Self::mismatch(key, ValueKind::Timestamp, value))
    }

    /// Required nested map.
    pub fn require_map(&self, key: &str) -> Result<&Payload, ShapeMismatch> {
        let value = self.require(key, ValueKind::Map)?;
        value
            .as_map()
            .ok_or_else(|| Self::mismatch(key, ValueKind::Map, value))
    }

    /// Optional text value: absent is `None`, a wrong kind is still an error.
    pub fn optional_text(&self, key: &str) -> Result<Option<&str>, ShapeMismatch> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(_) => self.require_text(key).map(Some),
        }
    }

    /// Optional integer value.
    pub fn optional_integer(&self, key: &str) -> Result<Option<i64>, ShapeMismatch> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(_) => self.require_integer(key).map(Some),
        }
    }

    /// Optional timestamp value.
    pub fn optional_timestamp(&self, key: &str) -> Result<Option<Timestamp>, ShapeMismatch> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(_) => self.require_timestamp(key).map(Some),
        }
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Payload {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Payload {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
