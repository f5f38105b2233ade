//! Explicit table descriptions and their static validation.
//!
//! A [`Schema`] is checked by [`validate_schema`] before any DDL is issued,
//! so a malformed description never leaves a half-created database behind.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error_handling::types::SchemaError;
use crate::storage::query::is_valid_identifier;
use crate::storage::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Numeric,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Numeric => "NUMERIC",
        }
    }
}

/// One column definition.
///
/// `column_type` is optional only so that a description assembled from
/// external input can be reported as invalid instead of failing to build.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: Option<ColumnType>,
    pub not_null: bool,
    pub default: Option<Value>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type: Some(column_type),
            not_null: false,
            default: None,
            primary_key: false,
            auto_increment: false,
            unique: false,
        }
    }

    pub fn untyped(name: &str) -> Self {
        Self {
            column_type: None,
            ..Self::new(name, ColumnType::Text)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn to_sql(&self) -> String {
        let mut sql = self.name.clone();
        if let Some(ty) = self.column_type {
            sql.push(' ');
            sql.push_str(ty.as_sql());
        }
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.auto_increment {
                sql.push_str(" AUTOINCREMENT");
            }
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            sql.push_str(" UNIQUE");
        }
        if let Some(ref default) = self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql_literal());
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
}

impl TableSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// `CREATE TABLE IF NOT EXISTS` for this description, under `table_name`.
    ///
    /// Rotated families reuse one description for every physical table, so
    /// the emitted name is a parameter rather than `self.name`.
    pub fn create_table_sql(&self, table_name: &str) -> String {
        let columns: Vec<String> = self.columns.iter().map(ColumnSpec::to_sql).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table_name,
            columns.join(", ")
        )
    }

    /// Index DDL for this description on `table_name`; every index name gets
    /// `suffix` appended so indexes of rotated tables never collide.
    pub fn create_index_sql(&self, table_name: &str, suffix: &str) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {}{} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    index.name,
                    suffix,
                    table_name,
                    index.columns.join(", ")
                )
            })
            .collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// An ordered set of table descriptions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub tables: Vec<TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Validates the description, returning it unchanged when it is well formed.
    pub fn validated(self) -> Result<Self, SchemaError> {
        let errors = validate_schema(&self);
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(SchemaError { errors })
        }
    }
}

/// Every problem found in `schema`, in declaration order. Empty means valid.
pub fn validate_schema(schema: &Schema) -> Vec<String> {
    let mut errors = Vec::new();
    let mut table_names = HashSet::new();

    for table in &schema.tables {
        validate_table(table, &mut errors);
        if !table_names.insert(table.name.as_str()) {
            errors.push(format!("Table {} is declared more than once", table.name));
        }
    }
    errors
}

fn validate_table(table: &TableSchema, errors: &mut Vec<String>) {
    let t = &table.name;
    if !is_valid_identifier(t) {
        errors.push(format!("Table name {:?} is not a valid identifier", t));
    }
    if table.columns.is_empty() {
        errors.push(format!("Table {} has no columns", t));
    }

    let mut seen = HashSet::new();
    let mut primary_keys = 0;
    for column in &table.columns {
        let c = &column.name;
        if !is_valid_identifier(c) {
            errors.push(format!("Column name {:?} in table {} is not a valid identifier", c, t));
        }
        if !seen.insert(c.as_str()) {
            errors.push(format!("Column {} in table {} is declared more than once", c, t));
        }
        if column.column_type.is_none() {
            errors.push(format!("Column {} in table {} has no type", c, t));
        }
        if column.primary_key {
            primary_keys += 1;
        }
        if column.auto_increment && !column.primary_key {
            errors.push(format!(
                "Column {} in table {} is autoincrement but not the primary key",
                c, t
            ));
        }
        if column.auto_increment && column.column_type != Some(ColumnType::Integer) {
            errors.push(format!(
                "Autoincrement column {} in table {} must be INTEGER",
                c, t
            ));
        }
    }
    if primary_keys > 1 {
        errors.push(format!("Table {} declares more than one primary key column", t));
    }

    for (position, index) in table.indexes.iter().enumerate() {
        if index.name.trim().is_empty() {
            errors.push(format!("Index #{} on table {} has no name", position + 1, t));
        } else if !is_valid_identifier(&index.name) {
            errors.push(format!(
                "Index name {:?} on table {} is not a valid identifier",
                index.name, t
            ));
        }
        if index.columns.is_empty() {
            errors.push(format!(
                "Index {} on table {} has no columns",
                index.name, t
            ));
        }
        for column in &index.columns {
            if !seen.contains(column.as_str()) {
                errors.push(format!(
                    "Index {} on table {} references unknown column {}",
                    index.name, t, column
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traffic_table() -> TableSchema {
        TableSchema::new("traffic")
            .column(ColumnSpec::new("id", ColumnType::Integer).primary_key().auto_increment())
            .column(ColumnSpec::new("data", ColumnType::Text).not_null())
            .column(ColumnSpec::new("direction", ColumnType::Text).default_value("unknown"))
            .index(IndexSpec::new("idx_traffic_data", &["data"]))
    }

    #[test]
    fn valid_schema_has_no_errors() {
        let schema = Schema::new().table(traffic_table());
        assert!(validate_schema(&schema).is_empty());
        assert!(schema.validated().is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let table = TableSchema::new("broken")
            .column(ColumnSpec::untyped("untyped"))
            .column(ColumnSpec::new("counter", ColumnType::Integer).auto_increment())
            .index(IndexSpec::new("", &["counter"]))
            .index(IndexSpec::new("idx_empty", &[]));
        let errors = validate_schema(&Schema::new().table(table));
        assert!(errors.iter().any(|e| e.contains("untyped") && e.contains("no type")));
        assert!(errors.iter().any(|e| e.contains("not the primary key")));
        assert!(errors.iter().any(|e| e.contains("has no name")));
        assert!(errors.iter().any(|e| e.contains("idx_empty") && e.contains("no columns")));
    }

    #[test]
    fn rejects_injected_identifiers() {
        let table = TableSchema::new("t; DROP TABLE x")
            .column(ColumnSpec::new("a", ColumnType::Text));
        let errors = validate_schema(&Schema::new().table(table));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn ddl_uses_given_table_name_and_suffix() {
        let table = traffic_table();
        let sql = table.create_table_sql("traffic_002");
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS traffic_002 (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             data TEXT NOT NULL, direction TEXT DEFAULT 'unknown')"
        );
        let indexes = table.create_index_sql("traffic_002", "_002");
        assert_eq!(
            indexes,
            vec!["CREATE INDEX IF NOT EXISTS idx_traffic_data_002 ON traffic_002 (data)"]
        );
    }
}
