//! Dynamic values, records and rows exchanged with the storage adapter.
//!
//! Tables are described at runtime (see [`crate::storage::schema`]), so
//! column values travel as [`Value`] rather than through typed entity
//! structs. Values are always bound as statement parameters; only
//! identifiers are ever interpolated into SQL text.

use std::cmp::Ordering;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// A single SQLite value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Number of bytes this value occupies in its text or blob form.
    ///
    /// Mirrors `LENGTH(CAST(col AS BLOB))` so in-memory accounting and
    /// accounting recomputed from disk agree.
    pub fn byte_len(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Integer(i) => i.to_string().len() as u64,
            Value::Real(f) => f.to_string().len() as u64,
            Value::Text(s) => s.len() as u64,
            Value::Blob(b) => b.len() as u64,
        }
    }

    fn class_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    /// Total order used when merging rows from several physical tables.
    ///
    /// NULL sorts first, then numbers (integers and reals compared
    /// numerically), then text byte-wise, then blobs byte-wise. This is the
    /// order SQLite itself applies in `ORDER BY` with the BINARY collation.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).total_cmp(b),
            (Value::Real(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => self.class_rank().cmp(&other.class_rank()),
        }
    }

    /// Renders the value as a SQL literal, used only for column defaults in DDL.
    pub(crate) fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
                format!("X'{}'", hex)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Blob(b) => serde_json::Value::from(b.clone()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A record to insert or the assignments of an update.
///
/// Each column maps to an optional value. Absent (`None`) entries are left
/// out of the generated statement entirely, so the column default applies;
/// an explicit `Some(Value::Null)` writes NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Option<Value>)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a column, replacing an earlier assignment of the same column.
    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.put(column, Some(value.into()));
        self
    }

    pub fn set_opt(mut self, column: &str, value: Option<impl Into<Value>>) -> Self {
        self.put(column, value.map(Into::into));
        self
    }

    pub fn put(&mut self, column: &str, value: Option<Value>) {
        match self.fields.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((column.to_string(), value)),
        }
    }

    /// Columns that carry a value, in insertion order.
    pub fn present(&self) -> Vec<(&str, &Value)> {
        self.fields
            .iter()
            .filter_map(|(c, v)| v.as_ref().map(|v| (c.as_str(), v)))
            .collect()
    }

    pub fn byte_len(&self) -> u64 {
        self.present().iter().map(|(_, v)| v.byte_len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }
}

/// Equality predicates joined with `AND`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    clauses: Vec<(String, Value)>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((column.to_string(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    pub order_by: Option<String>,
    pub order: SortOrder,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectOptions {
    pub fn ordered_by(column: &str, order: SortOrder) -> Self {
        Self {
            order_by: Some(column.to_string()),
            order,
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// A row read back from a table, with columns in table order.
///
/// Rows produced by the fan-out read are tagged with the physical table
/// they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
    pub source_table: Option<String>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (c, v) in &self.columns {
            map.insert(c.clone(), v.to_json());
        }
        if let Some(ref table) = self.source_table {
            map.insert(
                "_sourceTable".to_string(),
                serde_json::Value::String(table.clone()),
            );
        }
        map
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.source_table.is_some());
        let mut map = serializer.serialize_map(Some(self.columns.len() + extra))?;
        for (c, v) in &self.columns {
            map.serialize_entry(c, v)?;
        }
        if let Some(ref table) = self.source_table {
            map.serialize_entry("_sourceTable", table)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_filters_absent_fields() {
        let record = Record::new()
            .set("a", 1)
            .set_opt("b", None::<i64>)
            .set("c", Value::Null);
        let present: Vec<&str> = record.present().iter().map(|(c, _)| *c).collect();
        assert_eq!(present, vec!["a", "c"]);
    }

    #[test]
    fn record_set_replaces_existing_column() {
        let record = Record::new().set("a", 1).set("a", 2);
        assert_eq!(record.present(), vec![("a", &Value::Integer(2))]);
    }

    #[test]
    fn mixed_classes_follow_sqlite_order() {
        let mut values = vec![
            Value::Blob(vec![0]),
            Value::Text("b".into()),
            Value::Real(2.5),
            Value::Null,
            Value::Integer(2),
            Value::Text("a".into()),
        ];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Integer(2),
                Value::Real(2.5),
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::Blob(vec![0]),
            ]
        );
    }

    #[test]
    fn text_literal_escapes_quotes() {
        assert_eq!(Value::from("it's").to_sql_literal(), "'it''s'");
    }

    #[test]
    fn row_serializes_source_table() {
        let row = Row {
            columns: vec![("id".into(), Value::Integer(1))],
            source_table: Some("websocketData_001".into()),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["_sourceTable"], "websocketData_001");
    }

    fn any_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::Integer),
            (-1.0e9f64..1.0e9).prop_map(Value::Real),
            "[a-z]{0,6}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..4).prop_map(Value::Blob),
        ]
    }

    proptest! {
        #[test]
        fn total_cmp_is_antisymmetric(a in any_value(), b in any_value()) {
            prop_assert_eq!(a.total_cmp(&b), b.total_cmp(&a).reverse());
        }

        #[test]
        fn total_cmp_is_transitive(a in any_value(), b in any_value(), c in any_value()) {
            let mut v = vec![a, b, c];
            v.sort_by(|x, y| x.total_cmp(y));
            prop_assert_ne!(v[0].total_cmp(&v[1]), Ordering::Greater);
            prop_assert_ne!(v[1].total_cmp(&v[2]), Ordering::Greater);
            prop_assert_ne!(v[0].total_cmp(&v[2]), Ordering::Greater);
        }
    }
}
