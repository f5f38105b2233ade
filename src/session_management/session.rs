use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_handling::types::SessionError;
use crate::session_management::SessionStatus;
use crate::storage::rotation::RotationStats;
use crate::storage::types::{Record, Row};

static LAST_ID_MILLIS: AtomicI64 = AtomicI64::new(0);

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^session_\d+_[a-z0-9]{6}$").unwrap_or_else(|_| unreachable!())
    })
}

/// Generates `session_<millis>_<6 random [a-z0-9]>`.
///
/// The millisecond part never goes backwards within a process, even when
/// two ids are generated in the same millisecond.
pub fn generate_session_id() -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_ID_MILLIS.load(Ordering::Relaxed);
    let millis = loop {
        let next = now.max(last + 1);
        match LAST_ID_MILLIS.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(actual) => last = actual,
        }
    };
    let random = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", millis, &random[..6])
}

pub fn validate_session_id(id: &str) -> bool {
    session_id_pattern().is_match(id)
}

/// ISO-8601 UTC timestamp with millisecond precision, as stored in the catalog.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A session as listed in the workspace catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub test_name: String,
    pub workspace: String,
    pub description: String,
    pub status: SessionStatus,
    pub result: Option<String>,
    pub test_start_time: Option<String>,
    pub test_end_time: Option<String>,
    pub record_count: u64,
    pub data_size: u64,
    /// JSON description of the rotation policy of the traffic family.
    pub rotation_policy: Option<String>,
    pub db_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// JSON-encoded free-form summary.
    pub summary: Option<String>,
}

impl Session {
    pub fn new(session_id: &str, workspace: &str, db_path: &str, rotation_policy: String) -> Self {
        let now = now_iso();
        Self {
            session_id: session_id.to_string(),
            test_name: format!("Test Session {}", session_id),
            workspace: workspace.to_string(),
            description: String::new(),
            status: SessionStatus::Created,
            result: None,
            test_start_time: Some(now.clone()),
            test_end_time: None,
            record_count: 0,
            data_size: 0,
            rotation_policy: Some(rotation_policy),
            db_path: Some(db_path.to_string()),
            created_at: now.clone(),
            updated_at: now,
            summary: None,
        }
    }

    pub fn to_record(&self) -> Record {
        Record::new()
            .set("sessionId", self.session_id.as_str())
            .set("testName", self.test_name.as_str())
            .set("workspace", self.workspace.as_str())
            .set("description", self.description.as_str())
            .set("status", self.status.as_str())
            .set_opt("result", self.result.clone())
            .set_opt("testStartTime", self.test_start_time.clone())
            .set_opt("testEndTime", self.test_end_time.clone())
            .set("recordCount", self.record_count)
            .set("dataSize", self.data_size)
            .set_opt("rotationPolicy", self.rotation_policy.clone())
            .set_opt("dbPath", self.db_path.clone())
            .set("createdAt", self.created_at.as_str())
            .set("updatedAt", self.updated_at.as_str())
            .set_opt("summary", self.summary.clone())
    }

    pub fn from_row(row: &Row) -> Result<Self, SessionError> {
        let text = |column: &str| row.get_str(column).map(str::to_string);
        let session_id =
            text("sessionId").ok_or_else(|| SessionError::NotFound("<missing sessionId>".into()))?;
        let status = row.get_str("status").unwrap_or("created").parse()?;
        Ok(Self {
            test_name: text("testName").unwrap_or_default(),
            workspace: text("workspace").unwrap_or_default(),
            description: text("description").unwrap_or_default(),
            status,
            result: text("result"),
            test_start_time: text("testStartTime"),
            test_end_time: text("testEndTime"),
            record_count: row.get_i64("recordCount").unwrap_or(0).max(0) as u64,
            data_size: row.get_i64("dataSize").unwrap_or(0).max(0) as u64,
            rotation_policy: text("rotationPolicy"),
            db_path: text("dbPath"),
            created_at: text("createdAt").unwrap_or_default(),
            updated_at: text("updatedAt").unwrap_or_default(),
            summary: text("summary"),
            session_id,
        })
    }
}

/// Catalog row enriched with the traffic rotation statistics and the
/// decoded key/value metadata mirror of the session file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(flatten)]
    pub session: Session,
    pub websocket_stats: Option<RotationStats>,
    pub session_meta: serde_json::Map<String, serde_json::Value>,
}

/// One inbound message before normalization.
///
/// Every field but `data` is optional; see [`TrafficInput::normalize`] for
/// the defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TrafficInput {
    pub timestamp: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub direction: Option<String>,
    pub size: Option<u64>,
}

impl TrafficInput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Interprets a raw text frame.
    ///
    /// A JSON object carrying a `data` field is taken as an envelope with
    /// optional `timestamp`, `type`, `direction` and `size`. Anything else is
    /// recorded verbatim as the payload.
    pub fn from_text(raw: &str) -> Self {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(raw) {
            if map.contains_key("data") {
                if let Ok(input) = serde_json::from_value(serde_json::Value::Object(map)) {
                    return input;
                }
            }
        }
        Self::new(serde_json::Value::String(raw.to_string()))
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn with_direction(mut self, direction: &str) -> Self {
        self.direction = Some(direction.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Applies defaults: timestamp now, type `message`, direction `unknown`,
    /// non-string payloads serialized to JSON, size the byte length of the
    /// stored payload.
    pub fn normalize(self, session_id: &str) -> TrafficRecord {
        let data = match self.data {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        TrafficRecord {
            session_id: session_id.to_string(),
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            kind: self.kind.unwrap_or_else(|| "message".to_string()),
            direction: self.direction.unwrap_or_else(|| "unknown".to_string()),
            size: self.size.unwrap_or(data.len() as u64),
            data,
        }
    }
}

/// A normalized traffic record as written to `websocketData_NNN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub session_id: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    pub direction: String,
    pub size: u64,
}

impl TrafficRecord {
    pub fn to_record(&self) -> Record {
        Record::new()
            .set("sessionId", self.session_id.as_str())
            .set("timestamp", self.timestamp)
            .set("type", self.kind.as_str())
            .set("data", self.data.as_str())
            .set("direction", self.direction.as_str())
            .set("size", self.size)
    }
}

/// One row of the catalog `rotationHistory` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationRecord {
    pub id: i64,
    pub session_id: String,
    pub rotation_time: String,
    pub reason: String,
    pub from_table: String,
    pub to_table: String,
    pub records_transferred: u64,
    pub data_size: u64,
}

impl RotationRecord {
    pub fn from_row(row: &Row) -> Self {
        let text = |column: &str| row.get_str(column).unwrap_or_default().to_string();
        Self {
            id: row.get_i64("id").unwrap_or(0),
            session_id: text("sessionId"),
            rotation_time: text("rotationTime"),
            reason: text("reason"),
            from_table: text("fromTable"),
            to_table: text("toTable"),
            records_transferred: row.get_i64("recordsTransferred").unwrap_or(0).max(0) as u64,
            data_size: row.get_i64("dataSize").unwrap_or(0).max(0) as u64,
        }
    }
}
