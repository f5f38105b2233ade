//! Request/response surface exposed to a UI or IPC collaborator.
//!
//! A [`Workspaces`] registry owns, per workspace key, one session store and
//! one recording connection client whose frames go straight into that store.
//! Everything the collaborator should hear about is republished on a single
//! [`Notification`] channel with the channel names below, `<ws>` being the
//! workspace key and `<dataset>` a projection dataset key:
//!
//! | channel                        | source                            |
//! |--------------------------------|-----------------------------------|
//! | `session-created-<ws>`         | session created                   |
//! | `websocket-data-updated-<ws>`  | traffic record appended           |
//! | `meta-data-updated-<ws>`       | session metadata changed          |
//! | `ws-status-<ws>`               | recording connection state change |
//! | `ws-error-<ws>`                | recording connection error        |
//! | `ws-reconnect-failed-<ws>`     | reconnect attempts exhausted      |
//! | `batch-progress-<dataset>`     | projection batch progress         |

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error_handling::types::{SessionError, WorkspaceError};
use crate::network::client::ConnectionClient;
use crate::network::types::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, MessageSink, ReconnectSettings,
};
use crate::projection::store::ProjectionStore;
use crate::projection::types::ProjectionEvent;
use crate::session_management::events::SessionEvent;
use crate::session_management::session::{Session, SessionInfo};
use crate::session_management::session_manager::SessionManager;
use crate::storage::rotation::RotationPolicy;
use crate::storage::session_filter::SessionFilter;
use crate::storage::types::{Row, Value};

const NOTIFICATION_CAPACITY: usize = 1024;
pub const DEFAULT_TRAFFIC_LIMIT: u64 = 50;

/// One message pushed to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub channel: String,
    /// Workspace or dataset key the notification is scoped to.
    pub key: String,
    pub payload: JsonValue,
}

/// Settings shared by every workspace of a registry.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub storage_path: PathBuf,
    pub rotation_policy: RotationPolicy,
    pub reconnect: ReconnectSettings,
}

/// A stored traffic record formatted for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    /// Row id, or `<sourceTable>-<timestamp>` when the row has none.
    pub id: JsonValue,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: Option<i64>,
    pub session_id: Option<String>,
    pub data: Option<String>,
    pub direction: Option<String>,
    pub size: Option<i64>,
    pub workspace: String,
    pub source_table: Option<String>,
}

impl TrafficEvent {
    pub fn from_row(workspace: &str, row: &Row) -> Self {
        let timestamp = row.get_i64("timestamp");
        let id = match row.get("id") {
            Some(Value::Integer(id)) => json!(id),
            Some(Value::Text(id)) => json!(id),
            _ => json!(format!(
                "{}-{}",
                row.source_table.as_deref().unwrap_or("websocket"),
                timestamp.map(|t| t.to_string()).unwrap_or_default()
            )),
        };
        Self {
            id,
            kind: "websocket-data".to_string(),
            timestamp,
            session_id: row.get_str("sessionId").map(str::to_string),
            data: row.get_str("data").map(str::to_string),
            direction: row.get_str("direction").map(str::to_string),
            size: row.get_i64("size"),
            workspace: workspace.to_string(),
            source_table: row.source_table.clone(),
        }
    }
}

/// Connection state as reported at the boundary.
pub fn boundary_status(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Closing => "disconnecting",
        other => other.as_str(),
    }
}

struct Workspace {
    store: Arc<SessionManager>,
    client: ConnectionClient,
    cancel: CancellationToken,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct Workspaces {
    settings: WorkspaceSettings,
    workspaces: Mutex<HashMap<String, Workspace>>,
    notifications: broadcast::Sender<Notification>,
    cancel: CancellationToken,
}

fn publish(notifications: &broadcast::Sender<Notification>, channel: String, key: &str, payload: JsonValue) {
    trace!("Notify {}", channel);
    if notifications
        .send(Notification {
            channel,
            key: key.to_string(),
            payload,
        })
        .is_err()
    {
        trace!("No subscriber for notification");
    }
}

fn session_notification(workspace: &str, event: &SessionEvent) -> Option<(String, JsonValue)> {
    let channel = match event {
        SessionEvent::SessionCreated { .. } => format!("session-created-{}", workspace),
        SessionEvent::DataUpdated { .. } => format!("websocket-data-updated-{}", workspace),
        SessionEvent::MetadataUpdated { .. } => format!("meta-data-updated-{}", workspace),
        SessionEvent::TableRotated { .. } | SessionEvent::SessionClosed { .. } => return None,
    };
    Some((channel, serde_json::to_value(event).unwrap_or(JsonValue::Null)))
}

fn connection_notification(workspace: &str, event: &ConnectionEvent) -> Option<(String, JsonValue)> {
    match &event.kind {
        ConnectionEventKind::Status { state } => Some((
            format!("ws-status-{}", workspace),
            json!({ "status": boundary_status(*state), "workspace": workspace }),
        )),
        ConnectionEventKind::Error { error } => Some((
            format!("ws-error-{}", workspace),
            json!({ "error": error, "workspace": workspace }),
        )),
        ConnectionEventKind::ReconnectFailed { attempts } => Some((
            format!("ws-reconnect-failed-{}", workspace),
            json!({ "attempts": attempts, "workspace": workspace }),
        )),
        _ => None,
    }
}

/// Republishes every event of `events` mapped by `map` until cancelled.
fn forward<E, F>(
    mut events: broadcast::Receiver<E>,
    notifications: broadcast::Sender<Notification>,
    key: String,
    cancel: CancellationToken,
    map: F,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: Fn(&str, &E) -> Option<(String, JsonValue)> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if let Some((channel, payload)) = map(&key, &event) {
                        publish(&notifications, channel, &key, payload);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("[{}] Notification forwarder dropped {} event(s)", key, missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("[{}] Notification forwarder stopped", key);
    })
}

impl Workspaces {
    pub fn new(settings: WorkspaceSettings) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            settings,
            workspaces: Mutex::new(HashMap::new()),
            notifications,
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Opens the session store and recording client of `workspace`.
    /// Opening an already open workspace returns its existing store.
    pub async fn open_workspace(&self, workspace: &str) -> Result<Arc<SessionManager>, WorkspaceError> {
        let mut workspaces = self.workspaces.lock().await;
        if let Some(existing) = workspaces.get(workspace) {
            return Ok(existing.store.clone());
        }

        let store = Arc::new(
            SessionManager::open(
                workspace,
                &self.settings.storage_path,
                self.settings.rotation_policy,
            )
            .await?,
        );
        let sink: Arc<dyn MessageSink> = store.clone();
        let client = ConnectionClient::new(workspace, self.settings.reconnect, sink);
        let cancel = self.cancel.child_token();
        let forwarders = vec![
            forward(
                store.subscribe(),
                self.notifications.clone(),
                workspace.to_string(),
                cancel.clone(),
                session_notification,
            ),
            forward(
                client.subscribe(),
                self.notifications.clone(),
                workspace.to_string(),
                cancel.clone(),
                connection_notification,
            ),
        ];
        workspaces.insert(
            workspace.to_string(),
            Workspace {
                store: store.clone(),
                client,
                cancel,
                forwarders,
            },
        );
        info!("[{}] Workspace opened", workspace);
        Ok(store)
    }

    /// Republishes the batch progress of a projection store as
    /// `batch-progress-<dataset>` notifications.
    pub fn forward_projection(&self, store: &ProjectionStore) -> JoinHandle<()> {
        forward(
            store.subscribe(),
            self.notifications.clone(),
            "projection".to_string(),
            self.cancel.child_token(),
            |_, event: &ProjectionEvent| match event {
                ProjectionEvent::BatchProgress { data_key, .. } => Some((
                    format!("batch-progress-{}", data_key),
                    serde_json::to_value(event).unwrap_or(JsonValue::Null),
                )),
                _ => None,
            },
        )
    }

    async fn store(&self, workspace: &str) -> Option<Arc<SessionManager>> {
        self.workspaces
            .lock()
            .await
            .get(workspace)
            .map(|w| w.store.clone())
    }

    async fn require(&self, workspace: &str) -> Result<Arc<SessionManager>, WorkspaceError> {
        self.store(workspace)
            .await
            .ok_or_else(|| WorkspaceError::NotFound(workspace.to_string()))
    }

    pub async fn create_test_session(&self, workspace: &str) -> Result<String, WorkspaceError> {
        Ok(self.require(workspace).await?.create_session(None).await?)
    }

    pub async fn close_test_session(&self, workspace: &str) -> Result<(), WorkspaceError> {
        Ok(self.require(workspace).await?.close_session().await?)
    }

    /// Catalog listing; empty for a workspace that is not open.
    pub async fn get_all_sessions(
        &self,
        workspace: &str,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, WorkspaceError> {
        match self.store(workspace).await {
            Some(store) => Ok(store.list_sessions(filter).await?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_session_by_id(
        &self,
        workspace: &str,
        session_id: &str,
    ) -> Result<Option<SessionInfo>, WorkspaceError> {
        match self.store(workspace).await {
            Some(store) => Ok(store.get_session_by_id(session_id).await?),
            None => Ok(None),
        }
    }

    /// Newest traffic of a session, formatted for display.
    pub async fn get_session_websocket_data(
        &self,
        workspace: &str,
        session_id: &str,
        limit: Option<u64>,
    ) -> Result<Vec<TrafficEvent>, WorkspaceError> {
        let Some(store) = self.store(workspace).await else {
            return Ok(Vec::new());
        };
        let rows = match store
            .session_traffic(session_id, limit.unwrap_or(DEFAULT_TRAFFIC_LIMIT))
            .await
        {
            Ok(rows) => rows,
            Err(SessionError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(rows
            .iter()
            .map(|row| TrafficEvent::from_row(workspace, row))
            .collect())
    }

    /// Starts the recording connection of `workspace`.
    pub async fn start_connection(&self, workspace: &str, url: &str) -> Result<(), WorkspaceError> {
        let workspaces = self.workspaces.lock().await;
        let entry = workspaces
            .get(workspace)
            .ok_or_else(|| WorkspaceError::NotFound(workspace.to_string()))?;
        entry.client.connect(url).await?;
        info!("[{}] Recording connection started to {}", workspace, url);
        Ok(())
    }

    pub async fn stop_connection(&self, workspace: &str) -> Result<(), WorkspaceError> {
        let workspaces = self.workspaces.lock().await;
        let entry = workspaces
            .get(workspace)
            .ok_or_else(|| WorkspaceError::NotFound(workspace.to_string()))?;
        entry.client.disconnect().await;
        Ok(())
    }

    /// `connecting`, `connected`, `disconnecting` or `disconnected`.
    pub async fn check_connection(&self, workspace: &str) -> &'static str {
        self.workspaces
            .lock()
            .await
            .get(workspace)
            .map(|w| boundary_status(w.client.state()))
            .unwrap_or("disconnected")
    }

    /// Stops every client, closes every store and stops forwarding.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Workspace)> = self.workspaces.lock().await.drain().collect();
        for (key, workspace) in drained {
            workspace.client.disconnect().await;
            if let Err(e) = workspace.store.close_all().await {
                warn!("[{}] Error closing session store: {}", key, e);
            }
            workspace.cancel.cancel();
            for task in workspace.forwarders {
                if let Err(e) = task.await {
                    warn!("[{}] Forwarder failed: {}", key, e);
                }
            }
            info!("[{}] Workspace closed", key);
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::session_management::session::TrafficInput;

    fn settings(dir: &TempDir) -> WorkspaceSettings {
        WorkspaceSettings {
            storage_path: dir.path().to_path_buf(),
            rotation_policy: RotationPolicy::count_based(2),
            reconnect: ReconnectSettings::default(),
        }
    }

    async fn next_on(rx: &mut broadcast::Receiver<Notification>, channel: &str) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let n = rx.recv().await.unwrap();
                if n.channel == channel {
                    return n;
                }
            }
        })
        .await
        .expect("notification not received")
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let workspaces = Workspaces::new(settings(&dir));
        let a = workspaces.open_workspace("alpha").await.unwrap();
        let b = workspaces.open_workspace("alpha").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        workspaces.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_workspace_behaviour() {
        let dir = TempDir::new().unwrap();
        let workspaces = Workspaces::new(settings(&dir));
        assert!(matches!(
            workspaces.create_test_session("nope").await,
            Err(WorkspaceError::NotFound(_))
        ));
        assert!(workspaces
            .get_all_sessions("nope", &SessionFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(workspaces.get_session_by_id("nope", "x").await.unwrap().is_none());
        assert_eq!(workspaces.check_connection("nope").await, "disconnected");
    }

    #[tokio::test]
    async fn session_lifecycle_notifies_and_formats_traffic() {
        let dir = TempDir::new().unwrap();
        let workspaces = Workspaces::new(settings(&dir));
        let mut notifications = workspaces.subscribe();
        let store = workspaces.open_workspace("alpha").await.unwrap();

        let id = workspaces.create_test_session("alpha").await.unwrap();
        let created = next_on(&mut notifications, "session-created-alpha").await;
        assert_eq!(created.payload["sessionId"], id.as_str());
        assert_eq!(created.key, "alpha");

        for ts in 1..=3 {
            store
                .append_traffic_record(TrafficInput::new(json!("frame")).with_timestamp(ts))
                .await
                .unwrap();
        }
        next_on(&mut notifications, "websocket-data-updated-alpha").await;

        let events = workspaces
            .get_session_websocket_data("alpha", &id, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, Some(3));
        assert_eq!(events[0].kind, "websocket-data");
        assert_eq!(events[0].source_table.as_deref(), Some("websocketData_002"));
        assert_eq!(events[0].workspace, "alpha");
        assert!(events[0].id.is_number());

        workspaces.close_test_session("alpha").await.unwrap();
        let listed = workspaces
            .get_all_sessions("alpha", &SessionFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record_count, 3);
        workspaces.shutdown().await;
    }

    #[test]
    fn fallback_id_uses_source_table_and_timestamp() {
        let row = Row {
            columns: vec![("timestamp".into(), Value::Integer(77))],
            source_table: Some("websocketData_004".into()),
        };
        let event = TrafficEvent::from_row("alpha", &row);
        assert_eq!(event.id, json!("websocketData_004-77"));
    }

    #[test]
    fn closing_is_reported_as_disconnecting() {
        assert_eq!(boundary_status(ConnectionState::Closing), "disconnecting");
        assert_eq!(boundary_status(ConnectionState::Connected), "connected");
    }
}
