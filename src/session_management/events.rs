use serde::Serialize;

use crate::session_management::session::TrafficRecord;
use crate::storage::rotation::RotationEvent;

/// Notifications published by a workspace's session store.
///
/// Delivered over a `tokio::sync::broadcast` channel; a slow subscriber
/// loses the oldest events rather than blocking the writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: String },
    #[serde(rename_all = "camelCase")]
    DataUpdated {
        session_id: String,
        table_name: String,
        data: TrafficRecord,
    },
    #[serde(rename_all = "camelCase")]
    MetadataUpdated {
        session_id: String,
        data: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    TableRotated {
        session_id: String,
        rotation: RotationEvent,
    },
    #[serde(rename_all = "camelCase")]
    SessionClosed { session_id: String },
}
