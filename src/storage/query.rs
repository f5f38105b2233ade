//! SQL text assembly for the dynamic table layer.
//!
//! Only identifiers (table, column and index names) are ever interpolated
//! into statement text, and each one must pass [`is_valid_identifier`]
//! first. Values always travel as bound parameters.

use std::sync::OnceLock;

use regex::Regex;

use crate::error_handling::types::StorageError;
use crate::storage::types::{Conditions, Record, SelectOptions, SortOrder, Value};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!())
    })
}

pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

pub fn ensure_identifier(name: &str) -> Result<(), StorageError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

/// Statement text plus the values to bind, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    /// Key identifying the statement shape, used by the statement cache.
    ///
    /// Keys always start with `"<table>::"` so every entry of a table can be
    /// evicted by prefix when that table is dropped.
    pub fn cache_key(table: &str, op: &str, columns: &[&str]) -> String {
        format!("{}::{}::{}", table, op, columns.join(","))
    }
}

pub fn insert(table: &str, record: &Record) -> Result<Statement, StorageError> {
    ensure_identifier(table)?;
    let present = record.present();
    if present.is_empty() {
        return Err(StorageError::EmptyRecord(table.to_string()));
    }
    let mut columns = Vec::with_capacity(present.len());
    let mut params = Vec::with_capacity(present.len());
    for (column, value) in present {
        ensure_identifier(column)?;
        columns.push(column);
        params.push(value.clone());
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        ),
        params,
    })
}

fn where_clause(conditions: &Conditions, params: &mut Vec<Value>) -> Result<String, StorageError> {
    if conditions.is_empty() {
        return Ok(String::new());
    }
    let mut clauses = Vec::with_capacity(conditions.clauses().len());
    for (column, value) in conditions.clauses() {
        ensure_identifier(column)?;
        if value.is_null() {
            clauses.push(format!("{} IS NULL", column));
        } else {
            clauses.push(format!("{} = ?", column));
            params.push(value.clone());
        }
    }
    Ok(format!(" WHERE {}", clauses.join(" AND ")))
}

/// Single-table select. Ordering ties fall back to `rowid`, which keeps the
/// result identical to a plain scan order among equal keys.
pub fn select(
    table: &str,
    conditions: &Conditions,
    options: &SelectOptions,
) -> Result<Statement, StorageError> {
    ensure_identifier(table)?;
    let mut params = Vec::new();
    let mut sql = format!("SELECT * FROM {}", table);
    sql.push_str(&where_clause(conditions, &mut params)?);
    if let Some(ref column) = options.order_by {
        ensure_identifier(column)?;
        let direction = match options.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {} {}, rowid ASC", column, direction));
    } else {
        sql.push_str(" ORDER BY rowid ASC");
    }
    match (options.limit, options.offset) {
        (Some(limit), offset) => {
            sql.push_str(" LIMIT ?");
            params.push(Value::from(limit));
            if let Some(offset) = offset {
                sql.push_str(" OFFSET ?");
                params.push(Value::from(offset));
            }
        }
        (None, Some(offset)) => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            params.push(Value::from(offset));
        }
        (None, None) => {}
    }
    Ok(Statement { sql, params })
}

pub fn update(table: &str, set: &Record, conditions: &Conditions) -> Result<Statement, StorageError> {
    ensure_identifier(table)?;
    if conditions.is_empty() {
        return Err(StorageError::MissingConditions(table.to_string()));
    }
    let present = set.present();
    if present.is_empty() {
        return Err(StorageError::EmptyRecord(table.to_string()));
    }
    let mut params = Vec::new();
    let mut assignments = Vec::with_capacity(present.len());
    for (column, value) in present {
        ensure_identifier(column)?;
        assignments.push(format!("{} = ?", column));
        params.push(value.clone());
    }
    let mut sql = format!("UPDATE {} SET {}", table, assignments.join(", "));
    sql.push_str(&where_clause(conditions, &mut params)?);
    Ok(Statement { sql, params })
}

pub fn delete(table: &str, conditions: &Conditions) -> Result<Statement, StorageError> {
    ensure_identifier(table)?;
    if conditions.is_empty() {
        return Err(StorageError::MissingConditions(table.to_string()));
    }
    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", table);
    sql.push_str(&where_clause(conditions, &mut params)?);
    Ok(Statement { sql, params })
}
