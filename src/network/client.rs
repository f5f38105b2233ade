//! Single reconnecting WebSocket connection.
//!
//! A [`ConnectionClient`] runs one supervisor task per `connect` call:
//!
//! ```text
//!   connect ─► Connecting ──ok──► Connected ──close/error/no pong──┐
//!                 ▲  │                                             │
//!                 │  └─err────────────────────────┐                │
//!                 │                               ▼                ▼
//!                 └──── sleep(backoff) ◄── attempts left? ── Disconnected
//!                                                 │no
//!                                                 ▼
//!                                          ReconnectFailed
//! ```
//!
//! `disconnect` disables reconnection, cancels the task wherever it is
//! (connecting, connected or sleeping) and waits for it to finish.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error_handling::types::ConnectionError;
use crate::network::backoff::reconnect_delay;
use crate::network::types::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, MessageSink, ReconnectSettings,
};

const EVENT_CAPACITY: usize = 256;

/// Attempt count that disables automatic reconnection.
const RECONNECT_DISABLED: u32 = u32::MAX;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Shared {
    key: String,
    state: StdMutex<ConnectionState>,
    attempts: AtomicU32,
    outbound: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn emit(&self, kind: ConnectionEventKind) {
        if self.events.send(ConnectionEvent::new(&self.key, kind)).is_err() {
            trace!("[{}] No subscriber for connection event", self.key);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = match self.state.lock() {
            Ok(mut current) => {
                let changed = *current != state;
                *current = state;
                changed
            }
            Err(_) => false,
        };
        if changed {
            debug!("[{}] Connection is {}", self.key, state);
            self.emit(ConnectionEventKind::Status { state });
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = tx;
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// How a connected session ended.
enum SessionEnd {
    Cancelled,
    Closed { code: Option<u16>, reason: String },
    HeartbeatTimeout,
    Failed(String),
}

/// One logical connection, identified by `key`.
pub struct ConnectionClient {
    shared: Arc<Shared>,
    settings: ReconnectSettings,
    sink: Arc<dyn MessageSink>,
    greeting: Option<String>,
    running: Mutex<Option<Running>>,
}

impl ConnectionClient {
    /// Creates a client with its own event channel.
    pub fn new(key: &str, settings: ReconnectSettings, sink: Arc<dyn MessageSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(key, settings, sink, events)
    }

    /// Creates a client publishing on an existing event channel.
    pub fn with_events(
        key: &str,
        settings: ReconnectSettings,
        sink: Arc<dyn MessageSink>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                key: key.to_string(),
                state: StdMutex::new(ConnectionState::Disconnected),
                attempts: AtomicU32::new(0),
                outbound: StdMutex::new(None),
                events,
            }),
            settings,
            sink,
            greeting: None,
            running: Mutex::new(None),
        }
    }

    /// Text frame sent right after every successful open.
    pub fn with_greeting(mut self, greeting: String) -> Self {
        self.greeting = Some(greeting);
        self
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Whether the supervisor task is still connecting, connected or
    /// waiting to reconnect.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Starts connecting to `url`. Does nothing when the client is already
    /// running.
    pub async fn connect(&self, url: &str) -> Result<(), ConnectionError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConnectionError::InvalidUrl(url.to_string()));
        }
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            info!("[{}] Connection already exists", self.shared.key);
            return Ok(());
        }

        self.shared.attempts.store(0, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            shared: Arc::clone(&self.shared),
            settings: self.settings,
            sink: Arc::clone(&self.sink),
            greeting: self.greeting.clone(),
            url: url.to_string(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Closes the connection and cancels any pending reconnect.
    pub async fn disconnect(&self) {
        self.shared
            .attempts
            .store(RECONNECT_DISABLED, Ordering::SeqCst);
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        if self.shared.state() == ConnectionState::Connected {
            self.shared.set_state(ConnectionState::Closing);
        }
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!("[{}] Connection task failed: {}", self.shared.key, e);
        }
        self.shared
            .attempts
            .store(RECONNECT_DISABLED, Ordering::SeqCst);
        self.shared.set_outbound(None);
        self.shared.set_state(ConnectionState::Disconnected);
        info!("[{}] Connection closed manually", self.shared.key);
    }

    /// Queues a text frame. Fails when the socket is not open.
    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(self.shared.key.clone()));
        }
        let outbound = self
            .shared
            .outbound
            .lock()
            .ok()
            .and_then(|o| o.clone())
            .ok_or_else(|| ConnectionError::NotConnected(self.shared.key.clone()))?;
        outbound
            .send(Message::text(text))
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    settings: ReconnectSettings,
    sink: Arc<dyn MessageSink>,
    greeting: Option<String>,
    url: String,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let key = self.shared.key.clone();
        loop {
            self.shared.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    self.shared.attempts.store(0, Ordering::SeqCst);
                    info!("[{}] Connected to {}", key, self.url);
                    self.shared.set_state(ConnectionState::Connected);
                    self.shared.emit(ConnectionEventKind::Connected);
                    match self.serve(socket).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Closed { code, reason } => {
                            info!("[{}] Connection closed (code: {:?})", key, code);
                            self.shared.emit(ConnectionEventKind::Closed { code, reason });
                        }
                        SessionEnd::HeartbeatTimeout => {
                            warn!("[{}] No pong received, terminating connection", key);
                            self.shared.emit(ConnectionEventKind::Closed {
                                code: None,
                                reason: "heartbeat timeout".to_string(),
                            });
                        }
                        SessionEnd::Failed(e) => {
                            warn!("[{}] Connection error: {}", key, e);
                            self.shared.emit(ConnectionEventKind::Error { error: e });
                        }
                    }
                }
                Err(e) => {
                    let error = ConnectionError::from(e);
                    warn!("[{}] {}", key, error);
                    self.shared.emit(ConnectionEventKind::Error {
                        error: error.to_string(),
                    });
                }
            }

            self.shared.set_outbound(None);
            self.shared.set_state(ConnectionState::Disconnected);

            let attempts = self.shared.attempts.load(Ordering::SeqCst);
            if attempts == RECONNECT_DISABLED || self.cancel.is_cancelled() {
                break;
            }
            if self.settings.max_attempts.is_some_and(|max| attempts >= max) {
                error!("[{}] Max reconnect attempts reached", key);
                self.shared
                    .emit(ConnectionEventKind::ReconnectFailed { attempts });
                break;
            }
            self.shared.attempts.store(attempts + 1, Ordering::SeqCst);
            let delay = reconnect_delay(self.settings.base_interval, attempts, self.settings.max_delay);
            info!(
                "[{}] Reconnecting in {}ms (attempt {})",
                key,
                delay.as_millis(),
                attempts + 1
            );
            self.shared.emit(ConnectionEventKind::Reconnecting {
                attempt: attempts + 1,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.shared.set_outbound(None);
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("[{}] Connection task finished", key);
    }

    /// Pumps one open socket until it closes, fails, misses a heartbeat or
    /// the client is cancelled.
    async fn serve(&self, socket: Socket) -> SessionEnd {
        let key = &self.shared.key;
        let (mut write, mut read) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.shared.set_outbound(Some(tx));

        if let Some(ref greeting) = self.greeting {
            if let Err(e) = write.send(Message::text(greeting.clone())).await {
                return SessionEnd::Failed(e.to_string());
            }
            debug!("[{}] Sent greeting", key);
        }

        let ping_every = self.settings.ping_interval;
        let mut heartbeat = interval_at(Instant::now() + ping_every, ping_every);
        let mut alive = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("[{}] Close frame not sent: {}", key, e);
                    }
                    return SessionEnd::Cancelled;
                }
                Some(message) = rx.recv() => {
                    if let Err(e) = write.send(message).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    if !alive {
                        return SessionEnd::HeartbeatTimeout;
                    }
                    alive = false;
                    if let Err(e) = write.send(Message::Ping(Vec::<u8>::new().into())).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                    trace!("[{}] Ping sent", key);
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver(text.to_string()).await,
                    Some(Ok(Message::Binary(bytes))) => {
                        self.deliver(String::from_utf8_lossy(&bytes).into_owned()).await
                    }
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        return SessionEnd::Closed { code, reason };
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => {
                        return SessionEnd::Closed {
                            code: None,
                            reason: String::new(),
                        }
                    }
                },
            }
        }
    }

    async fn deliver(&self, payload: String) {
        trace!("[{}] Received {} byte(s)", self.shared.key, payload.len());
        if let Err(e) = self.sink.deliver(&self.shared.key, payload).await {
            error!("[{}] Error handling message: {}", self.shared.key, e);
        }
    }
}
