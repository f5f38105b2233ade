//! Table descriptions for the workspace catalog and the per-session files.

use crate::storage::schema::{ColumnSpec, ColumnType, IndexSpec, Schema, TableSchema};

pub const SESSIONS_TABLE: &str = "sessions";
pub const ROTATION_HISTORY_TABLE: &str = "rotationHistory";
pub const SESSION_INFO_TABLE: &str = "sessionInfo";
/// Base name of the rotated traffic family in every session file.
pub const TRAFFIC_TABLE: &str = "websocketData";

/// Name of the key/value metadata mirror inside a session file.
pub fn meta_table_name(session_id: &str) -> String {
    format!("{}_meta", session_id)
}

/// Columns shared by the catalog `sessions` table and the `sessionInfo` row
/// each session file carries about itself.
fn session_columns(table: TableSchema) -> TableSchema {
    table
        .column(ColumnSpec::new("sessionId", ColumnType::Text).primary_key().not_null())
        .column(ColumnSpec::new("testName", ColumnType::Text).not_null())
        .column(ColumnSpec::new("workspace", ColumnType::Text).not_null())
        .column(ColumnSpec::new("description", ColumnType::Text).default_value(""))
        .column(
            ColumnSpec::new("status", ColumnType::Text)
                .not_null()
                .default_value("created"),
        )
        .column(ColumnSpec::new("result", ColumnType::Text))
        .column(ColumnSpec::new("testStartTime", ColumnType::Text))
        .column(ColumnSpec::new("testEndTime", ColumnType::Text))
        .column(ColumnSpec::new("recordCount", ColumnType::Integer).default_value(0))
        .column(ColumnSpec::new("dataSize", ColumnType::Integer).default_value(0))
        .column(ColumnSpec::new("rotationPolicy", ColumnType::Text))
        .column(ColumnSpec::new("dbPath", ColumnType::Text))
        .column(ColumnSpec::new("createdAt", ColumnType::Text).not_null())
        .column(ColumnSpec::new("updatedAt", ColumnType::Text).not_null())
        .column(ColumnSpec::new("summary", ColumnType::Text))
}

pub fn catalog_schema() -> Schema {
    Schema::new()
        .table(
            session_columns(TableSchema::new(SESSIONS_TABLE))
                .index(IndexSpec::new("idx_sessions_status", &["status"]))
                .index(IndexSpec::new("idx_sessions_created_at", &["createdAt"]))
                .index(IndexSpec::new("idx_sessions_test_name", &["testName"])),
        )
        .table(
            TableSchema::new(ROTATION_HISTORY_TABLE)
                .column(
                    ColumnSpec::new("id", ColumnType::Integer)
                        .primary_key()
                        .auto_increment(),
                )
                .column(ColumnSpec::new("sessionId", ColumnType::Text).not_null())
                .column(ColumnSpec::new("rotationTime", ColumnType::Text).not_null())
                .column(ColumnSpec::new("reason", ColumnType::Text).not_null())
                .column(ColumnSpec::new("fromTable", ColumnType::Text).not_null())
                .column(ColumnSpec::new("toTable", ColumnType::Text).not_null())
                .column(ColumnSpec::new("recordsTransferred", ColumnType::Integer).default_value(0))
                .column(ColumnSpec::new("dataSize", ColumnType::Integer).default_value(0))
                .index(IndexSpec::new("idx_rotation_session_id", &["sessionId"]))
                .index(IndexSpec::new("idx_rotation_time", &["rotationTime"])),
        )
}

/// The traffic table description, applied to every `websocketData_NNN`.
pub fn traffic_table() -> TableSchema {
    TableSchema::new(TRAFFIC_TABLE)
        .column(
            ColumnSpec::new("id", ColumnType::Integer)
                .primary_key()
                .auto_increment(),
        )
        .column(ColumnSpec::new("sessionId", ColumnType::Text).not_null())
        .column(ColumnSpec::new("timestamp", ColumnType::Integer).not_null())
        .column(
            ColumnSpec::new("type", ColumnType::Text)
                .not_null()
                .default_value("message"),
        )
        .column(ColumnSpec::new("data", ColumnType::Text).not_null())
        .column(
            ColumnSpec::new("direction", ColumnType::Text)
                .not_null()
                .default_value("unknown"),
        )
        .column(ColumnSpec::new("size", ColumnType::Integer).not_null())
        .index(IndexSpec::new("idx_websocket_session_id", &["sessionId"]))
        .index(IndexSpec::new("idx_websocket_timestamp", &["timestamp"]))
}

/// Non-rotated tables of a session file.
pub fn session_file_schema(session_id: &str) -> Schema {
    Schema::new()
        .table(session_columns(TableSchema::new(SESSION_INFO_TABLE)))
        .table(
            TableSchema::new(&meta_table_name(session_id))
                .column(ColumnSpec::new("key", ColumnType::Text).primary_key().not_null())
                .column(ColumnSpec::new("value", ColumnType::Text))
                .column(ColumnSpec::new("updatedAt", ColumnType::Integer).not_null()),
        )
}
