use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::network::message::ClassifiedMessage;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of the raw text frames received by a connection.
///
/// Errors returned here are logged by the connection and never tear it down.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, source: &str, payload: String) -> Result<(), SinkError>;
}

/// Socket ready-state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing of the reconnect and heartbeat machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub base_interval: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub ping_interval: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: None,
            ping_interval: Duration::from_millis(30_000),
        }
    }
}

/// One configured connection of the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub name: String,
    pub url: String,
}

/// What happened on a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConnectionEventKind {
    Status { state: ConnectionState },
    Connected,
    /// The server announced the id it assigned to this client.
    #[serde(rename_all = "camelCase")]
    ServerAssigned { client_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    Subscribed { data_key: Option<String> },
    Message { message: ClassifiedMessage },
    #[serde(rename_all = "camelCase")]
    Reconnecting { attempt: u32, delay_ms: u64 },
    ReconnectFailed { attempts: u32 },
    Error { error: String },
    Closed { code: Option<u16>, reason: String },
}

/// Event published on a connection's notification channel, tagged with the
/// connection key (or manager connection name) it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEvent {
    pub source: String,
    #[serde(flatten)]
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    pub fn new(source: &str, kind: ConnectionEventKind) -> Self {
        Self {
            source: source.to_string(),
            kind,
        }
    }
}
