use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::error_handling::types::ConnectionError;
use crate::network::client::ConnectionClient;
use crate::network::message::{
    classify, publish_envelope, subscribe_request, unsubscribe_request, Inbound,
};
use crate::network::types::{
    ConnectionEvent, ConnectionEventKind, ConnectionSpec, ConnectionState, MessageSink,
    ReconnectSettings, SinkError,
};

const EVENT_CAPACITY: usize = 1024;

/// Classifies the frames of every managed connection and republishes them
/// as typed events.
struct Classifier {
    events: broadcast::Sender<ConnectionEvent>,
}

impl Classifier {
    fn emit(&self, name: &str, kind: ConnectionEventKind) {
        if self.events.send(ConnectionEvent::new(name, kind)).is_err() {
            debug!("[{}] No subscriber for classified message", name);
        }
    }
}

#[async_trait]
impl MessageSink for Classifier {
    async fn deliver(&self, name: &str, payload: String) -> Result<(), SinkError> {
        match classify(name, &payload) {
            Ok(Inbound::ServerAssigned { client_id }) => {
                info!("[{}] Server assigned client id {:?}", name, client_id);
                self.emit(name, ConnectionEventKind::ServerAssigned { client_id });
            }
            Ok(Inbound::Subscribed { data_key }) => {
                info!("[{}] Subscribed to {:?}", name, data_key);
                self.emit(name, ConnectionEventKind::Subscribed { data_key });
            }
            Ok(Inbound::Data(message)) => {
                debug!(
                    "[{}] {} message for {}",
                    name,
                    message.kind.as_str(),
                    message.data_key
                );
                self.emit(name, ConnectionEventKind::Message { message });
            }
            Err(e) => {
                warn!("[{}] Error parsing message: {}", name, e);
                self.emit(
                    name,
                    ConnectionEventKind::Error {
                        error: format!("Parse error: {}", e),
                    },
                );
            }
        }
        Ok(())
    }
}

/// Supervises a set of named connections.
///
/// Each connection subscribes to its own name on open and publishes its
/// lifecycle and classified messages on the manager's single event channel,
/// tagged with the connection name.
pub struct ConnectionManager {
    settings: ReconnectSettings,
    classifier: Arc<Classifier>,
    connections: Mutex<HashMap<String, ConnectionClient>>,
}

impl ConnectionManager {
    pub fn new(settings: ReconnectSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            classifier: Arc::new(Classifier { events }),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.classifier.events.subscribe()
    }

    /// Opens every configured connection. A failing entry is reported and
    /// does not prevent the others from starting.
    pub async fn init_connections(&self, specs: &[ConnectionSpec]) {
        for spec in specs {
            if let Err(e) = self.create_connection(&spec.url, &spec.name).await {
                warn!("[{}] Could not start connection: {}", spec.name, e);
                self.classifier.emit(
                    &spec.name,
                    ConnectionEventKind::Error {
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    /// Starts the connection `name`. Does nothing when it is already
    /// running; a connection that gave up reconnecting is replaced.
    pub async fn create_connection(&self, url: &str, name: &str) -> Result<(), ConnectionError> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(name) {
            if existing.is_running().await {
                info!("[{}] Connection already exists", name);
                return Ok(());
            }
            debug!("[{}] Replacing stopped connection", name);
            connections.remove(name);
        }
        info!("[{}] Creating connection to {}", name, url);
        let sink: Arc<dyn MessageSink> = self.classifier.clone();
        let client = ConnectionClient::with_events(
            name,
            self.settings,
            sink,
            self.classifier.events.clone(),
        )
        .with_greeting(subscribe_request(name));
        client.connect(url).await?;
        connections.insert(name.to_string(), client);
        Ok(())
    }

    /// Sends a raw text frame. Returns `false`, with a warning, when the
    /// connection is missing or not open.
    pub async fn send(&self, name: &str, message: String) -> bool {
        let connections = self.connections.lock().await;
        let Some(client) = connections.get(name) else {
            warn!("[{}] Cannot send message: no such connection", name);
            return false;
        };
        match client.send_text(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] Cannot send message: {}", name, e);
                false
            }
        }
    }

    pub async fn send_json(&self, name: &str, message: &Value) -> bool {
        self.send(name, message.to_string()).await
    }

    /// Publishes `data` wrapped in a `publish` envelope.
    pub async fn publish(&self, name: &str, data: &Value) -> bool {
        self.send(name, publish_envelope(name, data)).await
    }

    pub async fn unsubscribe(&self, name: &str) -> bool {
        self.send(name, unsubscribe_request(name)).await
    }

    /// Replaces connection `name` with a fresh one to `url`.
    pub async fn reconnect(&self, name: &str, url: &str) -> Result<(), ConnectionError> {
        self.close_connection(name).await;
        self.create_connection(url, name).await
    }

    /// Closes and forgets connection `name`; it will not reconnect.
    pub async fn close_connection(&self, name: &str) {
        let removed = self.connections.lock().await.remove(name);
        if let Some(client) = removed {
            client.disconnect().await;
            info!("[{}] Connection closed", name);
        }
    }

    pub async fn close_all(&self) {
        info!("Closing all connections");
        let drained: Vec<ConnectionClient> = self
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in drained {
            client.disconnect().await;
        }
    }

    pub async fn get_connection_status(&self, name: &str) -> ConnectionState {
        self.connections
            .lock()
            .await
            .get(name)
            .map(ConnectionClient::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn get_all_status(&self) -> BTreeMap<String, ConnectionState> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), client.state()))
            .collect()
    }
}
