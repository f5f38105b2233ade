//! Recording of classified connection messages into a session store.
//!
//! `TrafficRecorder` listens to the Connection Manager's event channel and
//! appends every data message, tagged with its kind and dataset key, to the
//! open session of one workspace. Control events and status changes are not
//! recorded. Messages arriving while no session is open are skipped.
//!
//! Minimal usage
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use ws_recorder::data_capture::TrafficRecorder;
//! use ws_recorder::network::ConnectionManager;
//! use ws_recorder::session_management::session_manager::SessionManager;
//!
//! # async fn run(store: Arc<SessionManager>, manager: ConnectionManager) {
//! let recorder = Arc::new(TrafficRecorder::new(store));
//! let cancel = CancellationToken::new();
//! let task = recorder.spawn(manager.subscribe(), cancel.clone());
//! // ...
//! cancel.cancel();
//! let summary = task.await.unwrap();
//! println!("recorded {} message(s)", summary.applied);
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, trace};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::data_capture::routing::{run_route, Route, Routed};
use crate::data_capture::types::{Direction, RoutingSummary};
use crate::error_handling::types::SessionError;
use crate::network::message::ClassifiedMessage;
use crate::network::types::{ConnectionEvent, ConnectionEventKind};
use crate::session_management::session::TrafficInput;
use crate::session_management::session_manager::SessionManager;

/// Appends classified messages to a workspace's open session.
pub struct TrafficRecorder {
    store: Arc<SessionManager>,
    name: String,
}

/// Traffic record for one classified message: the kind becomes the record
/// type and the payload is stored together with its dataset key.
pub fn traffic_input(message: &ClassifiedMessage) -> TrafficInput {
    TrafficInput::new(json!({
        "dataKey": message.data_key,
        "data": message.payload,
    }))
    .with_kind(message.kind.as_str())
    .with_direction(Direction::Inbound.as_str())
}

impl TrafficRecorder {
    pub fn new(store: Arc<SessionManager>) -> Self {
        let name = format!("recorder:{}", store.workspace());
        Self { store, name }
    }

    /// Starts routing `events` on a background task.
    pub fn spawn(
        self: Arc<Self>,
        events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<RoutingSummary> {
        tokio::spawn(async move { run_route(self.as_ref(), events, cancel).await })
    }
}

#[async_trait]
impl Route for TrafficRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn route(&self, event: &ConnectionEvent) -> Routed {
        let ConnectionEventKind::Message { ref message } = event.kind else {
            return Routed::Skipped;
        };
        match self.store.append_traffic_record(traffic_input(message)).await {
            Ok(outcome) => {
                trace!(
                    "[{}] {} message from {} stored in {}",
                    self.name,
                    message.kind.as_str(),
                    event.source,
                    outcome.table_name
                );
                Routed::Applied
            }
            Err(SessionError::NoActiveSession) => {
                debug!("[{}] No open session, message from {} dropped", self.name, event.source);
                Routed::Skipped
            }
            Err(e) => {
                error!("[{}] Failed to record message from {}: {}", self.name, event.source, e);
                Routed::Failed
            }
        }
    }
}
