use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{broadcast, Mutex};

use crate::data_capture::types::Direction;
use crate::error_handling::types::{SessionError, StorageError};
use crate::network::types::{MessageSink, SinkError};
use crate::session_management::active_session::ActiveSession;
use crate::session_management::events::SessionEvent;
use crate::session_management::schemas::{
    catalog_schema, meta_table_name, session_file_schema, traffic_table, ROTATION_HISTORY_TABLE,
    SESSIONS_TABLE, SESSION_INFO_TABLE, TRAFFIC_TABLE,
};
use crate::session_management::session::{
    generate_session_id, now_iso, now_millis, validate_session_id, RotationRecord, Session,
    SessionInfo, TrafficInput,
};
use crate::session_management::SessionStatus;
use crate::storage::database::{Database, InsertOutcome};
use crate::storage::rotation::{RotationEvent, RotationPolicy, RotationStats};
use crate::storage::session_filter::SessionFilter;
use crate::storage::types::{Conditions, Record, Row, SelectOptions, SortOrder};

const EVENT_CAPACITY: usize = 1024;

/// Session store of one workspace.
///
/// Owns the workspace catalog (`meta.db`, shared by every session of the
/// workspace) and at most one open session with its private database file.
///
/// # Fields Overview
///
/// - `workspace`: the workspace key, used to scope logs and catalog rows
/// - `data_dir`: `<storage_path>/sessions/<workspace>/`
/// - `meta_db`: the catalog with the `sessions` and `rotationHistory` tables
/// - `rotation_policy`: policy registered for each session's traffic family
/// - `active`: the open session, if any; every state-changing operation
///   holds this lock for its whole duration, which serializes appends,
///   metadata updates and close
/// - `events`: notification fan-out
pub struct SessionManager {
    workspace: String,
    data_dir: PathBuf,
    meta_db: Database,
    rotation_policy: RotationPolicy,
    active: Mutex<Option<ActiveSession>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Directory-safe form of a workspace key.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_opt_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        other => Some(json_text(other)),
    }
}

fn by_session(session_id: &str) -> Conditions {
    Conditions::new().eq("sessionId", session_id)
}

/// Columns of a session row that metadata updates may change.
fn metadata_columns(session: &Session) -> Record {
    Record::new()
        .set("testName", session.test_name.as_str())
        .set("description", session.description.as_str())
        .set("status", session.status.as_str())
        .set("result", session.result.clone())
        .set("testEndTime", session.test_end_time.clone())
        .set("summary", session.summary.clone())
        .set("updatedAt", session.updated_at.as_str())
}

fn stats_columns(session: &Session) -> Record {
    Record::new()
        .set("recordCount", session.record_count)
        .set("dataSize", session.data_size)
        .set("updatedAt", session.updated_at.as_str())
}

/// Reads the key/value mirror, decoding each value as JSON and keeping the
/// raw text when it is not valid JSON.
async fn read_meta(db: &Database, table: &str) -> Map<String, JsonValue> {
    let rows = match db
        .select(table, &Conditions::new(), &SelectOptions::default())
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Could not read session metadata from {}: {}", table, e);
            return Map::new();
        }
    };
    rows.iter()
        .filter_map(|row| {
            let key = row.get_str("key")?.to_string();
            let raw = row.get_str("value").unwrap_or_default();
            let value = serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()));
            Some((key, value))
        })
        .collect()
}

impl SessionManager {
    /// Opens (creating if needed) the catalog of `workspace` under
    /// `<storage_path>/sessions/<workspace>/`.
    pub async fn open(
        workspace: &str,
        storage_path: &Path,
        rotation_policy: RotationPolicy,
    ) -> Result<Self, SessionError> {
        let data_dir = storage_path.join("sessions").join(sanitize(workspace));
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(StorageError::from)?;
        let meta_db = Database::new(data_dir.join("meta.db"));
        meta_db.create_tables(&catalog_schema()).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!("[{}] Session manager ready in {}", workspace, data_dir.display());
        Ok(Self {
            workspace: workspace.to_string(),
            data_dir,
            meta_db,
            rotation_policy,
            active: Mutex::new(None),
            events,
        })
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("[{}] No subscriber for session event", self.workspace);
        }
    }

    pub async fn has_active_session(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn current_session_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|s| s.id().to_string())
    }

    fn session_db_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", session_id))
    }

    /// Creates a new session and makes it the open one.
    ///
    /// Fails with [`SessionError::AlreadyActive`] while another session is
    /// open; the open session is left untouched.
    pub async fn create_session(&self, session_id: Option<&str>) -> Result<String, SessionError> {
        let mut active = self.active.lock().await;
        if let Some(ref current) = *active {
            return Err(SessionError::AlreadyActive(current.id().to_string()));
        }
        let id = match session_id {
            Some(id) if validate_session_id(id) => id.to_string(),
            Some(id) => return Err(SessionError::InvalidSessionId(id.to_string())),
            None => generate_session_id(),
        };

        let mut opened = self.open_session(&id).await?;
        let mut initial = Map::new();
        initial.insert("sessionId".into(), JsonValue::String(id.clone()));
        initial.insert("status".into(), JsonValue::String(SessionStatus::Created.as_str().into()));
        initial.insert("workspace".into(), JsonValue::String(self.workspace.clone()));
        if let Err(e) = self.apply_metadata(&mut opened, initial).await {
            opened.db.close().await;
            if let Err(cleanup) = self.meta_db.delete(SESSIONS_TABLE, &by_session(&id)).await {
                warn!("[{}] Could not remove catalog row of {}: {}", self.workspace, id, cleanup);
            }
            return Err(e);
        }
        *active = Some(opened);

        info!("[{}] Session {} created", self.workspace, id);
        self.emit(SessionEvent::SessionCreated {
            session_id: id.clone(),
        });
        Ok(id)
    }

    async fn open_session(&self, id: &str) -> Result<ActiveSession, SessionError> {
        let db_path = self.session_db_path(id);
        let policy = serde_json::to_string(&self.rotation_policy)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        let session = Session::new(id, &self.workspace, &db_path.display().to_string(), policy);

        self.meta_db
            .insert(SESSIONS_TABLE, &session.to_record(), false)
            .await?;

        let db = Database::new(&db_path);
        let prepared: Result<(), StorageError> = async {
            db.create_tables(&session_file_schema(id)).await?;
            db.register_rotation(TRAFFIC_TABLE, self.rotation_policy, &traffic_table())
                .await?;
            db.insert(SESSION_INFO_TABLE, &session.to_record(), false)
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = prepared {
            db.close().await;
            if let Err(cleanup) = self.meta_db.delete(SESSIONS_TABLE, &by_session(id)).await {
                warn!("[{}] Could not remove catalog row of {}: {}", self.workspace, id, cleanup);
            }
            return Err(e.into());
        }
        debug!("[{}] Session file {} ready", self.workspace, db_path.display());
        Ok(ActiveSession {
            session,
            db,
            meta_table: meta_table_name(id),
        })
    }

    /// Closes the open session, if any, then creates a new one.
    pub async fn force_create_session(&self, session_id: Option<&str>) -> Result<String, SessionError> {
        if let Some(current) = self.current_session_id().await {
            warn!("[{}] Force closing session {}", self.workspace, current);
            self.close_session().await?;
        }
        self.create_session(session_id).await
    }

    /// Records one traffic message into the open session.
    ///
    /// The first record moves a `created` session to `active`. A rotation
    /// triggered by this write is logged in the catalog's `rotationHistory`
    /// together with a flush of the session totals; failing to log it does
    /// not fail the append, since the record is already stored.
    pub async fn append_traffic_record(
        &self,
        input: TrafficInput,
    ) -> Result<InsertOutcome, SessionError> {
        let mut guard = self.active.lock().await;
        let current = guard.as_mut().ok_or(SessionError::NoActiveSession)?;
        let record = input.normalize(current.id());
        let outcome = current
            .db
            .insert(TRAFFIC_TABLE, &record.to_record(), true)
            .await?;
        current.record_traffic(record.size);
        let session_id = current.id().to_string();

        if let Some(ref rotation) = outcome.rotation {
            if let Err(e) = self.record_rotation(current, rotation).await {
                error!(
                    "[{}] Could not record rotation {} -> {}: {}",
                    session_id, rotation.from_table, rotation.to_table, e
                );
            }
            self.emit(SessionEvent::TableRotated {
                session_id: session_id.clone(),
                rotation: rotation.clone(),
            });
        }
        if current.session.status == SessionStatus::Created {
            let mut fields = Map::new();
            fields.insert("status".into(), JsonValue::String(SessionStatus::Active.as_str().into()));
            self.apply_metadata(current, fields).await?;
        }

        debug!(
            "[{}] Recorded {} byte(s) into {}",
            session_id, record.size, outcome.table_name
        );
        self.emit(SessionEvent::DataUpdated {
            session_id,
            table_name: outcome.table_name.clone(),
            data: record,
        });
        Ok(outcome)
    }

    async fn record_rotation(
        &self,
        current: &mut ActiveSession,
        rotation: &RotationEvent,
    ) -> Result<(), SessionError> {
        let history = Record::new()
            .set("sessionId", current.id())
            .set(
                "rotationTime",
                rotation
                    .rotated_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            )
            .set("reason", rotation.reason.as_str())
            .set("fromTable", rotation.from_table.as_str())
            .set("toTable", rotation.to_table.as_str())
            .set("recordsTransferred", rotation.records_in_closed_table)
            .set("dataSize", rotation.data_size_in_closed_table);
        self.meta_db
            .insert(ROTATION_HISTORY_TABLE, &history, false)
            .await?;
        self.flush_stats(current).await
    }

    async fn flush_stats(&self, current: &mut ActiveSession) -> Result<(), SessionError> {
        current.session.updated_at = now_iso();
        let set = stats_columns(&current.session);
        let id = current.id().to_string();
        self.meta_db
            .update(SESSIONS_TABLE, &set, &by_session(&id))
            .await?;
        current
            .db
            .update(SESSION_INFO_TABLE, &set, &by_session(&id))
            .await?;
        debug!(
            "[{}] Flushed totals: {} record(s), {} byte(s)",
            id, current.session.record_count, current.session.data_size
        );
        Ok(())
    }

    /// Applies a metadata update to the open session.
    ///
    /// Recognized fields (`testName`, `description`, `status`, `result`,
    /// `endTime`/`testEndTime`, `summary`) are written to the catalog row and
    /// to the session file's `sessionInfo` row. Every field, recognized or
    /// not, is mirrored JSON-encoded into the session's key/value table.
    pub async fn update_metadata(&self, fields: Map<String, JsonValue>) -> Result<(), SessionError> {
        let mut guard = self.active.lock().await;
        let current = guard.as_mut().ok_or(SessionError::NoActiveSession)?;
        self.apply_metadata(current, fields).await
    }

    async fn apply_metadata(
        &self,
        current: &mut ActiveSession,
        fields: Map<String, JsonValue>,
    ) -> Result<(), SessionError> {
        let mut updated = current.session.clone();
        let mut recognized = false;
        let mut end_time_given = false;

        for (key, value) in &fields {
            match key.as_str() {
                "testName" => updated.test_name = json_text(value),
                "description" => updated.description = json_text(value),
                "status" => {
                    let status: SessionStatus = json_text(value).parse()?;
                    if !current.session.status.can_transition_to(status) {
                        return Err(SessionError::InvalidTransition {
                            from: current.session.status.to_string(),
                            to: status.to_string(),
                        });
                    }
                    updated.status = status;
                }
                "result" => updated.result = json_opt_text(value),
                "endTime" | "testEndTime" => {
                    updated.test_end_time = json_opt_text(value);
                    end_time_given = true;
                }
                "summary" => updated.summary = Some(value.to_string()),
                _ => continue,
            }
            recognized = true;
        }

        let now = now_iso();
        if updated.status != current.session.status
            && matches!(updated.status, SessionStatus::Completed | SessionStatus::Failed)
            && !end_time_given
        {
            updated.test_end_time = Some(now.clone());
        }
        updated.updated_at = now;

        let id = current.id().to_string();
        if recognized {
            let set = metadata_columns(&updated);
            self.meta_db
                .update(SESSIONS_TABLE, &set, &by_session(&id))
                .await?;
            current
                .db
                .update(SESSION_INFO_TABLE, &set, &by_session(&id))
                .await?;
        }

        let updated_at = now_millis();
        for (key, value) in &fields {
            let encoded = value.to_string();
            let changed = current
                .db
                .update(
                    &current.meta_table,
                    &Record::new()
                        .set("value", encoded.as_str())
                        .set("updatedAt", updated_at),
                    &Conditions::new().eq("key", key.as_str()),
                )
                .await?;
            if changed == 0 {
                current
                    .db
                    .insert(
                        &current.meta_table,
                        &Record::new()
                            .set("key", key.as_str())
                            .set("value", encoded)
                            .set("updatedAt", updated_at),
                        false,
                    )
                    .await?;
            }
        }

        if updated.status != current.session.status {
            info!(
                "[{}] Session {} is now {}",
                self.workspace, id, updated.status
            );
        }
        current.session = updated;
        debug!("[{}] Metadata updated ({} field(s))", id, fields.len());
        self.emit(SessionEvent::MetadataUpdated {
            session_id: id,
            data: fields,
        });
        Ok(())
    }

    async fn load_catalog_row(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        let rows = self
            .meta_db
            .select(SESSIONS_TABLE, &by_session(session_id), &SelectOptions::default())
            .await?;
        rows.first().map(Session::from_row).transpose()
    }

    /// Catalog row of the open session with live totals, traffic rotation
    /// statistics and the decoded metadata mirror.
    pub async fn session_info(&self) -> Result<SessionInfo, SessionError> {
        let guard = self.active.lock().await;
        let current = guard.as_ref().ok_or(SessionError::NoActiveSession)?;
        self.active_info(current).await
    }

    async fn active_info(&self, current: &ActiveSession) -> Result<SessionInfo, SessionError> {
        let mut session = self
            .load_catalog_row(current.id())
            .await?
            .ok_or_else(|| SessionError::NotFound(current.id().to_string()))?;
        session.record_count = current.session.record_count;
        session.data_size = current.session.data_size;
        let websocket_stats = match current.db.table_rotation_stats(TRAFFIC_TABLE).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("[{}] Could not read traffic statistics: {}", current.id(), e);
                None
            }
        };
        Ok(SessionInfo {
            session,
            websocket_stats,
            session_meta: read_meta(&current.db, &current.meta_table).await,
        })
    }

    /// Closes the open session. Does nothing when none is open.
    ///
    /// The session totals are flushed to both session rows before the file
    /// is closed; the session is closed even when that flush fails.
    pub async fn close_session(&self) -> Result<(), SessionError> {
        let Some(mut current) = self.active.lock().await.take() else {
            return Ok(());
        };
        let flushed = self.flush_stats(&mut current).await;
        current.db.close().await;
        let id = current.id().to_string();
        info!("[{}] Session {} closed", self.workspace, id);
        self.emit(SessionEvent::SessionClosed { session_id: id });
        flushed
    }

    /// Closes the open session and the catalog.
    pub async fn close_all(&self) -> Result<(), SessionError> {
        let closed = self.close_session().await;
        self.meta_db.close().await;
        closed
    }

    /// Catalog listing, newest first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError> {
        let rows = self
            .meta_db
            .select(SESSIONS_TABLE, &filter.conditions(), &filter.select_options())
            .await?;
        rows.iter().map(Session::from_row).collect()
    }

    /// Opens the file of a session that is not the open one, if it exists.
    async fn open_history_file(&self, session: &Session) -> Result<Option<Database>, SessionError> {
        let Some(ref path) = session.db_path else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            warn!("[{}] Session file {} is missing", session.session_id, path);
            return Ok(None);
        }
        let db = Database::new(path);
        db.register_rotation(TRAFFIC_TABLE, self.rotation_policy, &traffic_table())
            .await?;
        Ok(Some(db))
    }

    /// Any session of this workspace, open or not. `None` when the catalog
    /// has no such session.
    pub async fn get_session_by_id(&self, session_id: &str) -> Result<Option<SessionInfo>, SessionError> {
        {
            let guard = self.active.lock().await;
            if let Some(current) = guard.as_ref().filter(|c| c.id() == session_id) {
                return self.active_info(current).await.map(Some);
            }
        }
        let Some(mut session) = self.load_catalog_row(session_id).await? else {
            return Ok(None);
        };
        let Some(db) = self.open_history_file(&session).await? else {
            return Ok(Some(SessionInfo {
                session,
                websocket_stats: None,
                session_meta: Map::new(),
            }));
        };
        match db.rotated_record_count(TRAFFIC_TABLE).await {
            Ok(stored) if stored != session.record_count => {
                debug!(
                    "[{}] Catalog counts {} record(s), file holds {}",
                    session_id, session.record_count, stored
                );
                session.record_count = stored;
            }
            Ok(_) => {}
            Err(e) => warn!("[{}] Could not count stored records: {}", session_id, e),
        }
        let websocket_stats: Option<RotationStats> = db.table_rotation_stats(TRAFFIC_TABLE).await.ok();
        let session_meta = read_meta(&db, &meta_table_name(session_id)).await;
        db.close().await;
        Ok(Some(SessionInfo {
            session,
            websocket_stats,
            session_meta,
        }))
    }

    /// Up to `limit` traffic records of a session across all its tables,
    /// newest first.
    pub async fn session_traffic(&self, session_id: &str, limit: u64) -> Result<Vec<Row>, SessionError> {
        let options = SelectOptions::ordered_by("timestamp", SortOrder::Desc).limit(limit);
        {
            let guard = self.active.lock().await;
            if let Some(current) = guard.as_ref().filter(|c| c.id() == session_id) {
                return Ok(current
                    .db
                    .select_from_rotated_tables(TRAFFIC_TABLE, &Conditions::new(), &options)
                    .await?);
            }
        }
        let Some(session) = self.load_catalog_row(session_id).await? else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };
        let Some(db) = self.open_history_file(&session).await? else {
            return Ok(Vec::new());
        };
        let rows = db
            .select_from_rotated_tables(TRAFFIC_TABLE, &Conditions::new(), &options)
            .await;
        db.close().await;
        Ok(rows?)
    }

    pub async fn rotation_history(&self, session_id: &str) -> Result<Vec<RotationRecord>, SessionError> {
        let rows = self
            .meta_db
            .select(
                ROTATION_HISTORY_TABLE,
                &by_session(session_id),
                &SelectOptions::ordered_by("id", SortOrder::Asc),
            )
            .await?;
        Ok(rows.iter().map(RotationRecord::from_row).collect())
    }
}

#[async_trait]
impl MessageSink for SessionManager {
    /// Records a raw inbound frame; frames without an explicit direction are
    /// tagged `inbound`.
    async fn deliver(&self, _source: &str, payload: String) -> Result<(), SinkError> {
        let mut input = TrafficInput::from_text(&payload);
        if input.direction.is_none() {
            input.direction = Some(Direction::Inbound.as_str().to_string());
        }
        self.append_traffic_record(input).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn manager(policy: RotationPolicy) -> (TempDir, SessionManager) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::open("workspace-a", dir.path(), policy)
            .await
            .unwrap();
        (dir, manager)
    }

    fn fields(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn create_emits_one_session_created_event() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let mut events = manager.subscribe();
        let id = manager.create_session(None).await.unwrap();
        assert!(validate_session_id(&id));

        let mut created = Vec::new();
        loop {
            match events.try_recv() {
                Ok(SessionEvent::SessionCreated { session_id }) => created.push(session_id),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("unexpected receive error: {}", e),
            }
        }
        assert_eq!(created, vec![id.clone()]);
        assert!(manager.data_dir().join(format!("{}.db", id)).exists());
    }

    #[tokio::test]
    async fn second_create_fails_and_keeps_first_session() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let first = manager.create_session(None).await.unwrap();
        let err = manager.create_session(None).await.unwrap_err();
        assert!(err.is_state_error());
        assert!(matches!(err, SessionError::AlreadyActive(ref id) if *id == first));
        assert_eq!(manager.current_session_id().await, Some(first.clone()));
        assert_eq!(manager.list_sessions(&SessionFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_malformed_explicit_id() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let err = manager.create_session(Some("../../etc")).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidSessionId(_)));
        assert!(!manager.has_active_session().await);
    }

    #[tokio::test]
    async fn operations_without_session_are_state_errors() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let append = manager
            .append_traffic_record(TrafficInput::new(json!("x")))
            .await
            .unwrap_err();
        assert!(matches!(append, SessionError::NoActiveSession));
        let update = manager.update_metadata(Map::new()).await.unwrap_err();
        assert!(update.is_state_error());
        assert!(manager.session_info().await.unwrap_err().is_state_error());
        manager.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn first_append_activates_session() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let id = manager.create_session(None).await.unwrap();
        let mut events = manager.subscribe();
        let outcome = manager
            .append_traffic_record(TrafficInput::new(json!({"price": 10})))
            .await
            .unwrap();
        assert_eq!(outcome.table_name, "websocketData_001");

        let info = manager.session_info().await.unwrap();
        assert_eq!(info.session.status, SessionStatus::Active);
        assert_eq!(info.session.record_count, 1);
        assert_eq!(info.session_meta["status"], json!("active"));
        assert_eq!(info.websocket_stats.unwrap().total_records, 1);

        let mut saw_data = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::DataUpdated { session_id, table_name, data } = event {
                assert_eq!(session_id, id);
                assert_eq!(table_name, "websocketData_001");
                assert_eq!(data.data, r#"{"price":10}"#);
                saw_data = true;
            }
        }
        assert!(saw_data);
    }

    #[tokio::test]
    async fn metadata_round_trips_through_mirror() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        manager.create_session(None).await.unwrap();
        manager
            .update_metadata(fields(json!({
                "testName": "login flow",
                "summary": {"ok": 3, "failed": 0},
                "operator": "qa-bot",
                "attempts": 2,
                "numericText": "123",
                "tags": ["a", "b"],
            })))
            .await
            .unwrap();

        let info = manager.session_info().await.unwrap();
        assert_eq!(info.session.test_name, "login flow");
        let summary: JsonValue = serde_json::from_str(info.session.summary.as_deref().unwrap()).unwrap();
        assert_eq!(summary, json!({"ok": 3, "failed": 0}));
        assert_eq!(info.session_meta["operator"], json!("qa-bot"));
        assert_eq!(info.session_meta["attempts"], json!(2));
        assert_eq!(info.session_meta["numericText"], json!("123"));
        assert_eq!(info.session_meta["tags"], json!(["a", "b"]));
        assert_eq!(info.session_meta["summary"], json!({"ok": 3, "failed": 0}));
    }

    #[tokio::test]
    async fn catalog_and_session_file_stay_consistent() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let id = manager.create_session(None).await.unwrap();
        manager
            .update_metadata(fields(json!({"description": "nightly", "status": "active"})))
            .await
            .unwrap();

        let guard = manager.active.lock().await;
        let current = guard.as_ref().unwrap();
        let private = current
            .db
            .select(SESSION_INFO_TABLE, &by_session(&id), &SelectOptions::default())
            .await
            .unwrap();
        let private = Session::from_row(&private[0]).unwrap();
        let catalog = manager.load_catalog_row(&id).await.unwrap().unwrap();
        assert_eq!(private.description, "nightly");
        assert_eq!(private.status, catalog.status);
        assert_eq!(private.description, catalog.description);
        assert_eq!(private.updated_at, catalog.updated_at);
    }

    #[tokio::test]
    async fn completion_stamps_end_time_and_invalid_transition_is_refused() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        manager.create_session(None).await.unwrap();
        manager
            .update_metadata(fields(json!({"status": "completed", "result": "success"})))
            .await
            .unwrap();
        let info = manager.session_info().await.unwrap();
        assert!(info.session.test_end_time.is_some());
        assert_eq!(info.session.result.as_deref(), Some("success"));

        let err = manager
            .update_metadata(fields(json!({"status": "active", "note": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        let info = manager.session_info().await.unwrap();
        assert_eq!(info.session.status, SessionStatus::Completed);
        assert!(!info.session_meta.contains_key("note"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_flushes_totals() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let id = manager.create_session(None).await.unwrap();
        for i in 0..3 {
            manager
                .append_traffic_record(TrafficInput::new(json!("abcd")).with_timestamp(i))
                .await
                .unwrap();
        }
        manager.close_session().await.unwrap();
        manager.close_session().await.unwrap();
        assert!(!manager.has_active_session().await);
        assert!(matches!(
            manager
                .append_traffic_record(TrafficInput::new(json!("late")))
                .await,
            Err(SessionError::NoActiveSession)
        ));

        let info = manager.get_session_by_id(&id).await.unwrap().unwrap();
        assert_eq!(info.session.record_count, 3);
        assert_eq!(info.session.data_size, 12);
        assert_eq!(info.websocket_stats.unwrap().total_records, 3);
        assert_eq!(info.session_meta["workspace"], json!("workspace-a"));
    }

    #[tokio::test]
    async fn force_create_replaces_open_session() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let first = manager.create_session(None).await.unwrap();
        let second = manager.force_create_session(None).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.current_session_id().await, Some(second));
        assert_eq!(manager.list_sessions(&SessionFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rotation_is_logged_in_history() {
        let (_dir, manager) = manager(RotationPolicy::count_based(2)).await;
        let id = manager.create_session(None).await.unwrap();
        for i in 0..5 {
            manager
                .append_traffic_record(TrafficInput::new(json!(format!("m{}", i))).with_timestamp(i))
                .await
                .unwrap();
        }
        let history = manager.rotation_history(&id).await.unwrap();
        let moves: Vec<(String, String, u64)> = history
            .iter()
            .map(|h| (h.from_table.clone(), h.to_table.clone(), h.records_transferred))
            .collect();
        assert_eq!(
            moves,
            vec![
                ("websocketData_001".to_string(), "websocketData_002".to_string(), 2),
                ("websocketData_002".to_string(), "websocketData_003".to_string(), 2),
            ]
        );
        let catalog = manager.load_catalog_row(&id).await.unwrap().unwrap();
        assert_eq!(catalog.record_count, 4);

        let newest = manager.session_traffic(&id, 3).await.unwrap();
        let stamps: Vec<i64> = newest.iter().map(|r| r.get_i64("timestamp").unwrap()).collect();
        assert_eq!(stamps, vec![4, 3, 2]);
        assert_eq!(newest[0].source_table.as_deref(), Some("websocketData_003"));
    }

    #[tokio::test]
    async fn history_queries_on_closed_sessions() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let id = manager.create_session(None).await.unwrap();
        manager
            .append_traffic_record(TrafficInput::new(json!("hello")).with_timestamp(7))
            .await
            .unwrap();
        manager.close_session().await.unwrap();

        let traffic = manager.session_traffic(&id, 50).await.unwrap();
        assert_eq!(traffic.len(), 1);
        assert_eq!(traffic[0].get_str("data"), Some("hello"));

        let active = manager
            .list_sessions(&crate::storage::session_filter::by_status(SessionStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert!(manager.get_session_by_id("session_1_aaaaaa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sink_delivery_records_raw_frames() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let id = manager.create_session(None).await.unwrap();
        manager
            .deliver("feed", r#"{"type":"tick","data":{"p":1}}"#.to_string())
            .await
            .unwrap();
        manager.deliver("feed", "plain text".to_string()).await.unwrap();
        let rows = manager.session_traffic(&id, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get_str("direction") == Some("inbound")));
        assert!(rows.iter().any(|r| r.get_str("type") == Some("tick")));
    }

    async fn execute_raw(path: &Path, sql: &str) {
        use sqlx::Connection;
        let opts = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let mut conn = sqlx::SqliteConnection::connect_with(&opts).await.unwrap();
        sqlx::query(sql).execute(&mut conn).await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_initial_metadata_leaves_no_catalog_row() {
        let (_dir, manager) = manager(RotationPolicy::default()).await;
        let id = "session_1700000000000_abcdef";
        // A stale file whose metadata table lacks the key/value columns.
        execute_raw(
            &manager.data_dir().join(format!("{}.db", id)),
            &format!("CREATE TABLE \"{}_meta\" (x INTEGER)", id),
        )
        .await;

        assert!(manager.create_session(Some(id)).await.is_err());
        assert!(!manager.has_active_session().await);
        assert!(manager.list_sessions(&SessionFilter::default()).await.unwrap().is_empty());
        assert!(manager.get_session_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_succeeds_when_rotation_history_cannot_be_written() {
        let (_dir, manager) = manager(RotationPolicy::count_based(1)).await;
        let id = manager.create_session(None).await.unwrap();
        manager
            .append_traffic_record(TrafficInput::new(json!("first")))
            .await
            .unwrap();
        execute_raw(
            &manager.data_dir().join("meta.db"),
            &format!("DROP TABLE \"{}\"", ROTATION_HISTORY_TABLE),
        )
        .await;

        let mut events = manager.subscribe();
        let outcome = manager
            .append_traffic_record(TrafficInput::new(json!("second")))
            .await
            .unwrap();
        assert_eq!(outcome.table_name, "websocketData_002");
        assert!(outcome.rotation.is_some());

        let mut data_updated = 0;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::DataUpdated { session_id, table_name, .. } = event {
                assert_eq!((session_id.as_str(), table_name.as_str()), (id.as_str(), "websocketData_002"));
                data_updated += 1;
            }
        }
        assert_eq!(data_updated, 1);
        assert_eq!(manager.session_traffic(&id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unflushed_totals_are_recounted_from_session_file() {
        let (dir, manager) = manager(RotationPolicy::default()).await;
        let id = manager.create_session(None).await.unwrap();
        for n in 0..3 {
            manager
                .append_traffic_record(TrafficInput::new(json!(n)))
                .await
                .unwrap();
        }
        // Dropped without close, so the totals were never flushed.
        drop(manager);

        let reopened = SessionManager::open("workspace-a", dir.path(), RotationPolicy::default())
            .await
            .unwrap();
        let info = reopened.get_session_by_id(&id).await.unwrap().unwrap();
        assert_eq!(info.session.record_count, 3);
        assert_eq!(info.websocket_stats.map(|s| s.total_records), Some(3));
    }
}
