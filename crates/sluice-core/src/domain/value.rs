//! Payload values and records.
//!
//! Queue payloads are open mappings of field name to scalar. A [`Record`] keeps
//! its fields in insertion order as `(name, FieldValue)` pairs; the queue's
//! schema registry decides which SQL column each name maps to.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Prefix reserved for system columns (`_id`, `_ts`, `_status`, ...).
pub const RESERVED_PREFIX: char = '_';

/// A single scalar payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl FieldValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldValue::Text(_) => ColumnType::Text,
            FieldValue::Integer(_) => ColumnType::Integer,
            FieldValue::Real(_) => ColumnType::Real,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Real(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Text(_) => None,
        }
    }

    /// Decode a stored SQLite value. `NULL` and blobs have no payload meaning.
    pub(crate) fn from_sql(value: ValueRef<'_>) -> Option<Self> {
        match value {
            ValueRef::Null | ValueRef::Blob(_) => None,
            ValueRef::Integer(v) => Some(FieldValue::Integer(v)),
            ValueRef::Real(v) => Some(FieldValue::Real(v)),
            ValueRef::Text(bytes) => Some(FieldValue::Text(String::from_utf8_lossy(bytes).into_owned())),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Integer(v) => serde_json::Value::from(*v),
            FieldValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => s.fmt(f),
            FieldValue::Integer(v) => v.fmt(f),
            FieldValue::Real(v) => v.fmt(f),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            FieldValue::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
        })
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

/// Declared SQL type of a payload column, fixed by the first value observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }

    /// Map a declared type from `PRAGMA table_info`. An empty declaration
    /// (untyped column, e.g. a dedup column not yet written) yields `None`.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Some(ColumnType::Text),
            "INTEGER" => Some(ColumnType::Integer),
            "REAL" => Some(ColumnType::Real),
            _ => None,
        }
    }

    /// Map the result of SQLite's `typeof()`.
    pub(crate) fn from_storage_class(class: &str) -> Option<Self> {
        match class {
            "text" => Some(ColumnType::Text),
            "integer" => Some(ColumnType::Integer),
            "real" => Some(ColumnType::Real),
            _ => None,
        }
    }

    /// Fit a value into this column type.
    ///
    /// Integers widen into `Real` columns; every other mismatch is rejected
    /// and the value's own type is returned as the error.
    pub fn coerce(self, value: &FieldValue) -> Result<FieldValue, ColumnType> {
        match (self, value) {
            (ColumnType::Text, FieldValue::Text(_))
            | (ColumnType::Integer, FieldValue::Integer(_))
            | (ColumnType::Real, FieldValue::Real(_)) => Ok(value.clone()),
            (ColumnType::Real, FieldValue::Integer(v)) => Ok(FieldValue::Real(*v as f64)),
            _ => Err(value.column_type()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

/// Check that `name` can be used as a payload column.
pub fn validate_field_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("field name is empty".to_string());
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(format!("field name `{name}` uses the reserved `_` prefix"));
    }
    if name.chars().any(|c| c == '"' || c == '\'' || c.is_control()) {
        return Err(format!("field name `{name}` contains quote or control characters"));
    }
    Ok(())
}

/// An ordered open mapping of field name to scalar value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a field, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Exact-match lookup. Records read back from a queue carry the column's
    /// stored spelling.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Convert a JSON object into a record.
    ///
    /// Booleans become integers. Nested arrays/objects and `null` are rejected;
    /// the error is a human-readable reason.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let serde_json::Value::Object(map) = value else {
            return Err("record must be a JSON object".to_string());
        };
        let mut record = Record::new();
        for (name, v) in map {
            let field = match v {
                serde_json::Value::String(s) => FieldValue::Text(s.clone()),
                serde_json::Value::Bool(b) => FieldValue::from(*b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => FieldValue::Integer(i),
                    None => match n.as_f64() {
                        Some(f) => FieldValue::Real(f),
                        None => return Err(format!("field `{name}` is not representable")),
                    },
                },
                serde_json::Value::Null => {
                    return Err(format!("field `{name}` is null"));
                }
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    return Err(format!("field `{name}` holds a nested value; only scalars are allowed"));
                }
            };
            record.insert(name.clone(), field);
        }
        Ok(record)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(n, v)| (n.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl IntoIterator for Record {
    type Item = (String, FieldValue);
    type IntoIter = std::vec::IntoIter<(String, FieldValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            match value {
                FieldValue::Text(s) => map.serialize_entry(name, s)?,
                FieldValue::Integer(v) => map.serialize_entry(name, v)?,
                FieldValue::Real(v) => map.serialize_entry(name, v)?,
            }
        }
        map.end()
    }
}
