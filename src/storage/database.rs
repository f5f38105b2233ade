//! SQLite adapter with rotated table families.
//!
//! One [`Database`] wraps one database file. The connection pool is opened
//! lazily on first use with WAL journaling, `synchronous = NORMAL` and an
//! enlarged page cache, and is released again by [`Database::close`].
//!
//! # Rotation
//!
//! A base name registered with [`Database::register_rotation`] becomes a
//! family of physical tables `<base>_001`, `<base>_002`, ... Inserts against
//! the base name consult the family's [`RotationPolicy`] against the current
//! table's statistics *before* writing; when it fires, the next table is
//! created (with the same columns and `_NNN`-suffixed indexes) before the
//! current index moves, so a write is never routed to a table that does not
//! exist yet.
//!
//! ```text
//!  insert("websocketData", r)
//!        │
//!        ▼
//!  should_rotate(stats of _00K)? ──yes──► CREATE _00K+1, indexes ──► K := K+1
//!        │ no                                                        │
//!        ▼                                                           ▼
//!  INSERT INTO websocketData_00K  ◄──────────────────────────────────┘
//! ```
//!
//! All family bookkeeping happens while holding the family map lock, which
//! serializes writers to the same family.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteQueryResult, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Connection, Row as _, Sqlite, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use crate::error_handling::types::{RotationError, SchemaError, StorageError};
use crate::storage::query::{self, ensure_identifier, Statement};
use crate::storage::rotation::{
    index_suffix, parse_table_index, physical_table_name, PhysicalTableStats, RotationEvent,
    RotationPolicy, RotationStats, TableStats,
};
use crate::storage::schema::{validate_schema, Schema, TableSchema};
use crate::storage::types::{Conditions, Record, Row, SelectOptions, SortOrder, Value};

/// Result of one insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    /// Physical table the record was written to.
    pub table_name: String,
    pub row_id: i64,
    /// Set when this insert closed the previous table of its family.
    pub rotation: Option<RotationEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCount {
    pub table_name: String,
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatistics {
    pub path: String,
    pub tables: Vec<TableCount>,
    pub total_tables: usize,
    pub total_records: u64,
    pub file_size: u64,
}

struct RotatedFamily {
    policy: RotationPolicy,
    schema: TableSchema,
    oldest_index: u32,
    current_index: u32,
    current: TableStats,
}

impl RotatedFamily {
    fn current_table(&self, base: &str) -> String {
        physical_table_name(base, self.current_index)
    }

    fn tables(&self, base: &str) -> Vec<(u32, String)> {
        (self.oldest_index..=self.current_index)
            .map(|i| (i, physical_table_name(base, i)))
            .collect()
    }
}

pub struct Database {
    path: PathBuf,
    pool: Mutex<Option<SqlitePool>>,
    statements: StdMutex<HashMap<String, String>>,
    rotations: Mutex<HashMap<String, RotatedFamily>>,
}

fn write_err(e: sqlx::Error) -> StorageError {
    StorageError::WriteFailed(e.to_string())
}

fn read_err(e: sqlx::Error) -> StorageError {
    StorageError::ReadFailed(e.to_string())
}

fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Blob(b) => query.bind(b.clone()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<Row, StorageError> {
    let mut columns = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(read_err)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" => Value::Integer(row.try_get_unchecked::<i64, _>(i).map_err(read_err)?),
                "REAL" => Value::Real(row.try_get_unchecked::<f64, _>(i).map_err(read_err)?),
                "BLOB" => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(i).map_err(read_err)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(i).map_err(read_err)?),
            }
        };
        columns.push((column.name().to_string(), value));
    }
    Ok(Row {
        columns,
        source_table: None,
    })
}

async fn execute(
    conn: &mut SqliteConnection,
    stmt: &Statement,
) -> Result<SqliteQueryResult, StorageError> {
    bind_values(sqlx::query(&stmt.sql), &stmt.params)
        .execute(&mut *conn)
        .await
        .map_err(write_err)
}

async fn fetch(conn: &mut SqliteConnection, stmt: &Statement) -> Result<Vec<Row>, StorageError> {
    let rows = bind_values(sqlx::query(&stmt.sql), &stmt.params)
        .fetch_all(&mut *conn)
        .await
        .map_err(read_err)?;
    rows.iter().map(decode_row).collect()
}

async fn list_tables(conn: &mut SqliteConnection) -> Result<Vec<String>, StorageError> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(read_err)
}

async fn count_rows(conn: &mut SqliteConnection, table: &str) -> Result<u64, StorageError> {
    ensure_identifier(table)?;
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(&mut *conn)
        .await
        .map_err(read_err)?;
    Ok(count.max(0) as u64)
}

async fn create_physical_table(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    table: &str,
    suffix: &str,
) -> Result<(), StorageError> {
    sqlx::query(&schema.create_table_sql(table))
        .execute(&mut *conn)
        .await
        .map_err(write_err)?;
    for ddl in schema.create_index_sql(table, suffix) {
        sqlx::query(&ddl).execute(&mut *conn).await.map_err(write_err)?;
    }
    Ok(())
}

/// Record count and byte size of an existing table.
async fn measure_table(
    conn: &mut SqliteConnection,
    schema: &TableSchema,
    table: &str,
) -> Result<(u64, u64), StorageError> {
    let sizes: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("COALESCE(LENGTH(CAST({} AS BLOB)), 0)", c.name))
        .collect();
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM({}), 0) FROM {}",
        sizes.join(" + "),
        table
    );
    let (count, size): (i64, i64) = sqlx::query_as(&sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(read_err)?;
    Ok((count.max(0) as u64, size.max(0) as u64))
}

fn sort_rows(rows: &mut [Row], options: &SelectOptions) {
    if let Some(ref column) = options.order_by {
        let null = Value::Null;
        rows.sort_by(|a, b| {
            let left = a.get(column).unwrap_or(&null);
            let right = b.get(column).unwrap_or(&null);
            match options.order {
                SortOrder::Asc => left.total_cmp(right),
                SortOrder::Desc => right.total_cmp(left),
            }
        });
    }
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool: Mutex::new(None),
            statements: StdMutex::new(HashMap::new()),
            rotations: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_open(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Returns the pool, opening the database file on first use.
    async fn pool(&self) -> Result<SqlitePool, StorageError> {
        let mut guard = self.pool.lock().await;
        if let Some(ref pool) = *guard {
            return Ok(pool.clone());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        // A single long-lived connection keeps this a single-writer database
        // and keeps the per-connection pragmas below in effect.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        for pragma in ["PRAGMA cache_size = -32000", "PRAGMA temp_store = MEMORY"] {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        }
        info!("Opened database {}", self.path.display());
        *guard = Some(pool.clone());
        Ok(pool)
    }

    pub async fn open(&self) -> Result<(), StorageError> {
        self.pool().await.map(|_| ())
    }

    /// Closes the pool and forgets cached statements. Calling it again is a no-op.
    pub async fn close(&self) {
        let pool = self.pool.lock().await.take();
        self.statements_guard().clear();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Closed database {}", self.path.display());
        }
    }

    fn statements_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.statements.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict_statements(&self, table: &str) -> usize {
        let prefix = format!("{}::", table);
        let mut cache = self.statements_guard();
        let before = cache.len();
        cache.retain(|key, _| !key.starts_with(&prefix));
        before - cache.len()
    }

    /// Insert statement for `record` on `table`, reusing the cached text of
    /// an earlier insert with the same column set.
    fn insert_statement(&self, table: &str, record: &Record) -> Result<Statement, StorageError> {
        let present = record.present();
        let columns: Vec<&str> = present.iter().map(|(c, _)| *c).collect();
        let key = Statement::cache_key(table, "insert", &columns);
        if let Some(sql) = self.statements_guard().get(&key) {
            return Ok(Statement {
                sql: sql.clone(),
                params: present.iter().map(|(_, v)| (*v).clone()).collect(),
            });
        }
        let stmt = query::insert(table, record)?;
        self.statements_guard().insert(key, stmt.sql.clone());
        Ok(stmt)
    }

    /// Creates every table and index of `schema`. Safe to call repeatedly.
    pub async fn create_tables(&self, schema: &Schema) -> Result<(), StorageError> {
        let errors = validate_schema(schema);
        if !errors.is_empty() {
            return Err(SchemaError { errors }.into());
        }
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(write_err)?;
        for table in &schema.tables {
            create_physical_table(&mut tx, table, &table.name, "").await?;
        }
        tx.commit().await.map_err(write_err)?;
        debug!("Created {} table(s) in {}", schema.tables.len(), self.path.display());
        Ok(())
    }

    /// Registers `policy` for the family `base` described by `table`.
    ///
    /// Existing `<base>_NNN` tables are picked up so a reopened file resumes
    /// writing at its highest index; `<base>_001` is created when none exist.
    pub async fn register_rotation(
        &self,
        base: &str,
        policy: RotationPolicy,
        table: &TableSchema,
    ) -> Result<(), StorageError> {
        ensure_identifier(base)?;
        let errors = validate_schema(&Schema::new().table(table.clone()));
        if !errors.is_empty() {
            return Err(SchemaError { errors }.into());
        }
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(read_err)?;
        let mut rotations = self.rotations.lock().await;

        let indices: Vec<u32> = list_tables(&mut conn)
            .await?
            .iter()
            .filter_map(|t| parse_table_index(base, t))
            .collect();
        let (oldest_index, current_index) = match (indices.iter().min(), indices.iter().max()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => {
                let first = physical_table_name(base, 1);
                create_physical_table(&mut conn, table, &first, &index_suffix(1)).await?;
                info!("Created first table {} of family {}", first, base);
                (1, 1)
            }
        };
        let current_table = physical_table_name(base, current_index);
        let (record_count, data_size) = measure_table(&mut conn, table, &current_table).await?;
        debug!(
            "Family {} resumes at {} with {} record(s), policy {}",
            base,
            current_table,
            record_count,
            policy.kind.as_str()
        );
        rotations.insert(
            base.to_string(),
            RotatedFamily {
                policy,
                schema: table.clone(),
                oldest_index,
                current_index,
                current: TableStats {
                    record_count,
                    data_size,
                    created_at: Utc::now(),
                },
            },
        );
        Ok(())
    }

    pub async fn disable_table_rotation(&self, base: &str) -> Result<(), StorageError> {
        let mut rotations = self.rotations.lock().await;
        let family = rotations
            .get_mut(base)
            .ok_or_else(|| RotationError::NotConfigured(base.to_string()))?;
        family.policy.enabled = false;
        info!("Rotation disabled for {}", base);
        Ok(())
    }

    pub async fn current_table_name(&self, base: &str) -> Result<String, StorageError> {
        let rotations = self.rotations.lock().await;
        rotations
            .get(base)
            .map(|f| f.current_table(base))
            .ok_or_else(|| RotationError::NotConfigured(base.to_string()).into())
    }

    pub async fn rotated_tables(&self, base: &str) -> Result<Vec<String>, StorageError> {
        let rotations = self.rotations.lock().await;
        let family = rotations
            .get(base)
            .ok_or_else(|| RotationError::NotConfigured(base.to_string()))?;
        Ok(family.tables(base).into_iter().map(|(_, t)| t).collect())
    }

    async fn advance(
        conn: &mut SqliteConnection,
        base: &str,
        family: &mut RotatedFamily,
        reason: String,
    ) -> Result<RotationEvent, StorageError> {
        let from_table = family.current_table(base);
        let next_index = family.current_index + 1;
        let to_table = physical_table_name(base, next_index);
        create_physical_table(conn, &family.schema, &to_table, &index_suffix(next_index)).await?;

        let now = Utc::now();
        let event = RotationEvent {
            base_name: base.to_string(),
            from_table,
            to_table,
            records_in_closed_table: family.current.record_count,
            data_size_in_closed_table: family.current.data_size,
            reason,
            rotated_at: now,
        };
        family.current_index = next_index;
        family.current = TableStats::empty(now);
        info!(
            "Rotated {} -> {} ({}, {} record(s) closed)",
            event.from_table, event.to_table, event.reason, event.records_in_closed_table
        );
        Ok(event)
    }

    /// Closes the current table of `base` and starts the next one.
    pub async fn rotate_table(&self, base: &str) -> Result<RotationEvent, StorageError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(write_err)?;
        let mut rotations = self.rotations.lock().await;
        let family = rotations
            .get_mut(base)
            .ok_or_else(|| RotationError::NotConfigured(base.to_string()))?;
        if !family.policy.enabled {
            return Err(RotationError::Disabled(base.to_string()).into());
        }
        Self::advance(&mut conn, base, family, "manual rotation".to_string()).await
    }

    async fn insert_into(
        &self,
        conn: &mut SqliteConnection,
        rotations: &mut HashMap<String, RotatedFamily>,
        table: &str,
        record: &Record,
        auto_rotate: bool,
    ) -> Result<InsertOutcome, StorageError> {
        if record.is_empty() {
            return Err(StorageError::EmptyRecord(table.to_string()));
        }
        let Some(family) = rotations.get_mut(table) else {
            let stmt = self.insert_statement(table, record)?;
            let result = execute(conn, &stmt).await?;
            return Ok(InsertOutcome {
                table_name: table.to_string(),
                row_id: result.last_insert_rowid(),
                rotation: None,
            });
        };

        let mut rotation = None;
        if auto_rotate && family.policy.should_rotate(&family.current, Utc::now()) {
            let reason = family.policy.reason();
            rotation = Some(Self::advance(conn, table, family, reason).await?);
        }
        let target = family.current_table(table);
        let stmt = self.insert_statement(&target, record)?;
        let result = execute(conn, &stmt).await?;
        family.current.record_count += 1;
        family.current.data_size += record.byte_len();
        Ok(InsertOutcome {
            table_name: target,
            row_id: result.last_insert_rowid(),
            rotation,
        })
    }

    /// Inserts `record` into `table`.
    ///
    /// When `table` is a registered family base name, the record goes to the
    /// family's current physical table, rotating first if `auto_rotate` is
    /// set and the policy fires. Columns without a value are left out of the
    /// statement; a record with no values at all is refused.
    pub async fn insert(
        &self,
        table: &str,
        record: &Record,
        auto_rotate: bool,
    ) -> Result<InsertOutcome, StorageError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(write_err)?;
        let mut rotations = self.rotations.lock().await;
        let outcome = self
            .insert_into(&mut conn, &mut rotations, table, record, auto_rotate)
            .await?;
        debug!("Inserted row {} into {}", outcome.row_id, outcome.table_name);
        Ok(outcome)
    }

    /// Inserts every record in one transaction, with the same per-record
    /// rotation behaviour as [`Database::insert`].
    ///
    /// Family statistics are only kept when the transaction commits.
    pub async fn insert_batch(
        &self,
        table: &str,
        records: &[Record],
        auto_rotate: bool,
    ) -> Result<Vec<InsertOutcome>, StorageError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(write_err)?;
        let mut rotations = self.rotations.lock().await;
        let snapshot = rotations.get(table).map(|f| {
            (f.current_index, f.current)
        });

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            match self
                .insert_into(&mut tx, &mut rotations, table, record, auto_rotate)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if let (Some(family), Some((index, stats))) = (rotations.get_mut(table), snapshot) {
                        family.current_index = index;
                        family.current = stats;
                    }
                    warn!("Batch insert into {} rolled back: {}", table, e);
                    return Err(e);
                }
            }
        }
        if let Err(e) = tx.commit().await {
            if let (Some(family), Some((index, stats))) = (rotations.get_mut(table), snapshot) {
                family.current_index = index;
                family.current = stats;
            }
            return Err(write_err(e));
        }
        debug!("Inserted {} row(s) into {}", outcomes.len(), table);
        Ok(outcomes)
    }

    /// Reads from a single physical table, ordering and paging in SQL.
    pub async fn select(
        &self,
        table: &str,
        conditions: &Conditions,
        options: &SelectOptions,
    ) -> Result<Vec<Row>, StorageError> {
        let stmt = query::select(table, conditions, options)?;
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(read_err)?;
        fetch(&mut conn, &stmt).await
    }

    /// Reads across every physical table of family `base`.
    ///
    /// Each table is asked for at most `offset + limit` rows in the requested
    /// order, the partial results are merged with a stable sort on
    /// [`Value::total_cmp`], and paging is applied to the merged list. Equal
    /// keys keep scan order: older tables first, then rowid. Every row is
    /// tagged with its source table.
    pub async fn select_from_rotated_tables(
        &self,
        base: &str,
        conditions: &Conditions,
        options: &SelectOptions,
    ) -> Result<Vec<Row>, StorageError> {
        let tables = self.rotated_tables(base).await?;
        let per_table = SelectOptions {
            order_by: options.order_by.clone(),
            order: options.order,
            limit: options
                .limit
                .map(|l| l.saturating_add(options.offset.unwrap_or(0))),
            offset: None,
        };
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(read_err)?;

        let mut merged = Vec::new();
        for table in tables {
            let stmt = query::select(&table, conditions, &per_table)?;
            for mut row in fetch(&mut conn, &stmt).await? {
                row.source_table = Some(table.clone());
                merged.push(row);
            }
        }
        sort_rows(&mut merged, options);
        let offset = options.offset.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(merged.into_iter().skip(offset).take(limit).collect())
    }

    /// Updates matching rows of one physical table, returning how many changed.
    pub async fn update(
        &self,
        table: &str,
        set: &Record,
        conditions: &Conditions,
    ) -> Result<u64, StorageError> {
        let stmt = query::update(table, set, conditions)?;
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(write_err)?;
        Ok(execute(&mut conn, &stmt).await?.rows_affected())
    }

    pub async fn delete(&self, table: &str, conditions: &Conditions) -> Result<u64, StorageError> {
        let stmt = query::delete(table, conditions)?;
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(write_err)?;
        Ok(execute(&mut conn, &stmt).await?.rows_affected())
    }

    /// Drops the oldest physical tables of `base` so that at most
    /// `keep_count` remain, returning the dropped names. The current table
    /// is always kept.
    pub async fn cleanup_rotated_tables(
        &self,
        base: &str,
        keep_count: u32,
    ) -> Result<Vec<String>, StorageError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(write_err)?;
        let mut rotations = self.rotations.lock().await;
        let family = rotations
            .get_mut(base)
            .ok_or_else(|| RotationError::NotConfigured(base.to_string()))?;

        let keep = keep_count.max(1);
        let existing = family.current_index - family.oldest_index + 1;
        if existing <= keep {
            return Ok(Vec::new());
        }
        let new_oldest = family.current_index - keep + 1;
        let mut dropped = Vec::new();
        for index in family.oldest_index..new_oldest {
            let table = physical_table_name(base, index);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&mut *conn)
                .await
                .map_err(write_err)?;
            let evicted = self.evict_statements(&table);
            debug!("Dropped {} ({} cached statement(s) evicted)", table, evicted);
            dropped.push(table);
        }
        family.oldest_index = new_oldest;
        conn.clear_cached_statements().await.map_err(write_err)?;
        info!("Cleaned up {} table(s) of {}", dropped.len(), base);
        Ok(dropped)
    }

    pub async fn table_rotation_stats(&self, base: &str) -> Result<RotationStats, StorageError> {
        let (policy, current_index, tables) = {
            let rotations = self.rotations.lock().await;
            let family = rotations
                .get(base)
                .ok_or_else(|| RotationError::NotConfigured(base.to_string()))?;
            (family.policy, family.current_index, family.tables(base))
        };
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(read_err)?;
        let mut physical = Vec::with_capacity(tables.len());
        for (index, table_name) in tables {
            let record_count = count_rows(&mut conn, &table_name).await?;
            physical.push(PhysicalTableStats {
                table_name,
                index,
                record_count,
            });
        }
        Ok(RotationStats {
            base_name: base.to_string(),
            enabled: policy.enabled,
            kind: policy.kind,
            threshold: policy.threshold,
            current_index,
            current_table: physical_table_name(base, current_index),
            total_tables: physical.len(),
            total_records: physical.iter().map(|t| t.record_count).sum(),
            tables: physical,
        })
    }

    pub async fn table_record_count(&self, table: &str) -> Result<u64, StorageError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(read_err)?;
        count_rows(&mut conn, table).await
    }

    /// Records stored across every physical table of a family.
    pub async fn rotated_record_count(&self, base: &str) -> Result<u64, StorageError> {
        Ok(self.table_rotation_stats(base).await?.total_records)
    }

    pub async fn statistics(&self) -> Result<DatabaseStatistics, StorageError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(read_err)?;
        let mut tables = Vec::new();
        for table_name in list_tables(&mut conn).await? {
            if !query::is_valid_identifier(&table_name) {
                continue;
            }
            let record_count = count_rows(&mut conn, &table_name).await?;
            tables.push(TableCount {
                table_name,
                record_count,
            });
        }
        let file_size = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(DatabaseStatistics {
            path: self.path.display().to_string(),
            total_tables: tables.len(),
            total_records: tables.iter().map(|t| t.record_count).sum(),
            tables,
            file_size,
        })
    }

    pub async fn vacuum(&self) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query("VACUUM").execute(&pool).await.map_err(write_err)?;
        info!("Vacuumed {}", self.path.display());
        Ok(())
    }

    /// Writes a consistent copy of the database to `target`, which must not exist.
    pub async fn backup<P: AsRef<Path>>(&self, target: P) -> Result<(), StorageError> {
        let target = target.as_ref();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = self.pool().await?;
        sqlx::query("VACUUM INTO ?")
            .bind(target.display().to_string())
            .execute(&pool)
            .await
            .map_err(write_err)?;
        info!("Backed up {} to {}", self.path.display(), target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{ColumnSpec, ColumnType, IndexSpec};
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("test.db"));
        (dir, db)
    }

    fn traffic_table() -> TableSchema {
        TableSchema::new("traffic")
            .column(ColumnSpec::new("id", ColumnType::Integer).primary_key().auto_increment())
            .column(ColumnSpec::new("timestamp", ColumnType::Integer).not_null())
            .column(ColumnSpec::new("data", ColumnType::Text).not_null())
            .column(ColumnSpec::new("direction", ColumnType::Text).default_value("unknown"))
            .index(IndexSpec::new("idx_traffic_timestamp", &["timestamp"]))
    }

    fn record(ts: i64) -> Record {
        Record::new().set("timestamp", ts).set("data", format!("m{}", ts))
    }

    #[tokio::test]
    async fn create_tables_twice_is_idempotent() {
        let (_dir, db) = temp_db();
        let schema = Schema::new().table(traffic_table());
        db.create_tables(&schema).await.unwrap();
        db.create_tables(&schema).await.unwrap();

        let pool = db.pool().await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'traffic'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let indexes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_traffic_timestamp'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!((tables, indexes), (1, 1));
    }

    #[tokio::test]
    async fn invalid_schema_runs_no_ddl() {
        let (_dir, db) = temp_db();
        let schema = Schema::new()
            .table(traffic_table())
            .table(TableSchema::new("bad").column(ColumnSpec::untyped("x")));
        let err = db.create_tables(&schema).await.unwrap_err();
        assert!(matches!(err, StorageError::Schema(_)));
        let stats = db.statistics().await.unwrap();
        assert_eq!(stats.total_tables, 0);
    }

    #[tokio::test]
    async fn insert_skips_absent_columns_and_applies_defaults() {
        let (_dir, db) = temp_db();
        db.create_tables(&Schema::new().table(traffic_table())).await.unwrap();
        let r = record(1).set_opt("direction", None::<String>);
        let outcome = db.insert("traffic", &r, true).await.unwrap();
        assert_eq!(outcome.table_name, "traffic");
        assert!(outcome.rotation.is_none());

        let rows = db
            .select("traffic", &Conditions::new(), &SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(rows[0].get_str("direction"), Some("unknown"));
    }

    #[tokio::test]
    async fn empty_record_is_refused() {
        let (_dir, db) = temp_db();
        db.create_tables(&Schema::new().table(traffic_table())).await.unwrap();
        let err = db.insert("traffic", &Record::new(), true).await.unwrap_err();
        assert!(matches!(err, StorageError::EmptyRecord(_)));
    }

    #[tokio::test]
    async fn rotation_creates_ceil_n_over_t_tables() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::count_based(10), &traffic_table())
            .await
            .unwrap();
        let mut rotations = 0;
        for ts in 0..25 {
            let outcome = db.insert("traffic", &record(ts), true).await.unwrap();
            if outcome.rotation.is_some() {
                rotations += 1;
            }
        }
        assert_eq!(rotations, 2);
        let stats = db.table_rotation_stats("traffic").await.unwrap();
        assert_eq!(stats.current_index, 3);
        assert_eq!(stats.total_records, 25);
        let counts: Vec<u64> = stats.tables.iter().map(|t| t.record_count).collect();
        assert_eq!(counts, vec![10, 10, 5]);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn table_count_is_ceil_n_over_t(threshold in 1u64..12, n in 1u64..60) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let stats = rt.block_on(async {
                let (_dir, db) = temp_db();
                db.register_rotation("traffic", RotationPolicy::count_based(threshold), &traffic_table())
                    .await
                    .unwrap();
                let records: Vec<Record> = (0..n as i64).map(record).collect();
                db.insert_batch("traffic", &records, true).await.unwrap();
                let stats = db.table_rotation_stats("traffic").await.unwrap();
                assert_eq!(db.rotated_record_count("traffic").await.unwrap(), n);
                db.close().await;
                stats
            });

            let expected_tables = n.div_ceil(threshold);
            proptest::prop_assert_eq!(stats.total_tables as u64, expected_tables);
            proptest::prop_assert_eq!(stats.current_index as u64, expected_tables);
            proptest::prop_assert_eq!(stats.total_records, n);
            let (last, full) = stats.tables.split_last().unwrap();
            proptest::prop_assert!(full.iter().all(|t| t.record_count == threshold));
            proptest::prop_assert_eq!(last.record_count, n - threshold * (expected_tables - 1));
        }
    }

    #[tokio::test]
    async fn twenty_five_thousand_records_fill_three_tables() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::count_based(10_000), &traffic_table())
            .await
            .unwrap();
        let records: Vec<Record> = (0..25_000).map(record).collect();
        let outcomes = db.insert_batch("traffic", &records, true).await.unwrap();
        assert_eq!(outcomes.last().unwrap().table_name, "traffic_003");

        let stats = db.table_rotation_stats("traffic").await.unwrap();
        assert_eq!(stats.current_index, 3);
        assert_eq!(stats.total_records, 25_000);
        let counts: Vec<(String, u64)> = stats
            .tables
            .iter()
            .map(|t| (t.table_name.clone(), t.record_count))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("traffic_001".to_string(), 10_000),
                ("traffic_002".to_string(), 10_000),
                ("traffic_003".to_string(), 5_000),
            ]
        );
    }

    #[tokio::test]
    async fn rotated_indexes_are_suffixed() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::count_based(1), &traffic_table())
            .await
            .unwrap();
        db.insert("traffic", &record(1), true).await.unwrap();
        db.insert("traffic", &record(2), true).await.unwrap();
        let pool = db.pool().await.unwrap();
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_traffic%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(names, vec!["idx_traffic_timestamp_001", "idx_traffic_timestamp_002"]);
    }

    #[tokio::test]
    async fn fan_out_returns_global_top_l() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::count_based(4), &traffic_table())
            .await
            .unwrap();
        // Interleaved timestamps so the newest rows are spread across tables.
        for ts in [5, 50, 7, 70, 1, 90, 3, 30, 8, 80, 2, 20] {
            db.insert("traffic", &record(ts), true).await.unwrap();
        }
        let rows = db
            .select_from_rotated_tables(
                "traffic",
                &Conditions::new(),
                &SelectOptions::ordered_by("timestamp", SortOrder::Desc).limit(4),
            )
            .await
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.get_i64("timestamp").unwrap()).collect();
        assert_eq!(ts, vec![90, 80, 70, 50]);
        assert_eq!(rows[0].source_table.as_deref(), Some("traffic_002"));

        let page = db
            .select_from_rotated_tables(
                "traffic",
                &Conditions::new(),
                &SelectOptions::ordered_by("timestamp", SortOrder::Desc)
                    .limit(2)
                    .offset(4),
            )
            .await
            .unwrap();
        let ts: Vec<i64> = page.iter().map(|r| r.get_i64("timestamp").unwrap()).collect();
        assert_eq!(ts, vec![30, 20]);
    }

    #[tokio::test]
    async fn fan_out_ties_keep_scan_order() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::count_based(2), &traffic_table())
            .await
            .unwrap();
        for _ in 0..5 {
            db.insert("traffic", &record(7), true).await.unwrap();
        }
        let rows = db
            .select_from_rotated_tables(
                "traffic",
                &Conditions::new(),
                &SelectOptions::ordered_by("timestamp", SortOrder::Desc),
            )
            .await
            .unwrap();
        let order: Vec<(String, i64)> = rows
            .iter()
            .map(|r| (r.source_table.clone().unwrap(), r.get_i64("id").unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("traffic_001".to_string(), 1),
                ("traffic_001".to_string(), 2),
                ("traffic_002".to_string(), 1),
                ("traffic_002".to_string(), 2),
                ("traffic_003".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn cleanup_keeps_newest_tables() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::count_based(1), &traffic_table())
            .await
            .unwrap();
        for ts in 0..4 {
            db.insert("traffic", &record(ts), true).await.unwrap();
        }
        let dropped = db.cleanup_rotated_tables("traffic", 2).await.unwrap();
        assert_eq!(dropped, vec!["traffic_001", "traffic_002"]);
        assert_eq!(
            db.rotated_tables("traffic").await.unwrap(),
            vec!["traffic_003", "traffic_004"]
        );
        assert!(db.statements_guard().keys().all(|k| !k.starts_with("traffic_001::")));

        // Still writable after cleanup.
        let outcome = db.insert("traffic", &record(9), true).await.unwrap();
        assert_eq!(outcome.table_name, "traffic_005");
    }

    #[tokio::test]
    async fn cleanup_without_policy_fails() {
        let (_dir, db) = temp_db();
        let err = db.cleanup_rotated_tables("traffic", 1).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Rotation(RotationError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn reopened_file_resumes_at_highest_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.db");
        {
            let db = Database::new(&path);
            db.register_rotation("traffic", RotationPolicy::count_based(2), &traffic_table())
                .await
                .unwrap();
            for ts in 0..5 {
                db.insert("traffic", &record(ts), true).await.unwrap();
            }
            db.close().await;
            db.close().await;
        }
        let db = Database::new(&path);
        db.register_rotation("traffic", RotationPolicy::count_based(2), &traffic_table())
            .await
            .unwrap();
        assert_eq!(db.current_table_name("traffic").await.unwrap(), "traffic_003");
        db.insert("traffic", &record(5), true).await.unwrap();
        let outcome = db.insert("traffic", &record(6), true).await.unwrap();
        assert_eq!(outcome.table_name, "traffic_004");
    }

    #[tokio::test]
    async fn manual_rotation_and_disable() {
        let (_dir, db) = temp_db();
        db.register_rotation("traffic", RotationPolicy::manual(), &traffic_table())
            .await
            .unwrap();
        db.insert("traffic", &record(1), true).await.unwrap();
        let event = db.rotate_table("traffic").await.unwrap();
        assert_eq!(event.from_table, "traffic_001");
        assert_eq!(event.to_table, "traffic_002");
        assert_eq!(event.records_in_closed_table, 1);

        db.disable_table_rotation("traffic").await.unwrap();
        let err = db.rotate_table("traffic").await.unwrap_err();
        assert!(matches!(err, StorageError::Rotation(RotationError::Disabled(_))));
    }

    #[tokio::test]
    async fn update_and_delete_require_conditions() {
        let (_dir, db) = temp_db();
        db.create_tables(&Schema::new().table(traffic_table())).await.unwrap();
        db.insert("traffic", &record(1), false).await.unwrap();
        db.insert("traffic", &record(2), false).await.unwrap();

        let changed = db
            .update(
                "traffic",
                &Record::new().set("direction", "inbound"),
                &Conditions::new().eq("timestamp", 1),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(db
            .delete("traffic", &Conditions::new())
            .await
            .is_err());
        let deleted = db
            .delete("traffic", &Conditions::new().eq("timestamp", 2))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.table_record_count("traffic").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backup_and_vacuum() {
        let (dir, db) = temp_db();
        db.create_tables(&Schema::new().table(traffic_table())).await.unwrap();
        db.insert("traffic", &record(1), false).await.unwrap();
        db.vacuum().await.unwrap();
        let target = dir.path().join("backup").join("copy.db");
        db.backup(&target).await.unwrap();

        let copy = Database::new(&target);
        assert_eq!(copy.table_record_count("traffic").await.unwrap(), 1);
    }
}
