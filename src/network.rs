//! WebSocket connectivity.
//!
//! - `client`: one reconnecting connection feeding a [`types::MessageSink`].
//! - `manager`: named connections with subscribe-on-open and message
//!   classification.
//! - `message`: frame classification and outbound envelopes.
//! - `backoff`: reconnect delay computation.

pub mod backoff;
pub mod client;
pub mod manager;
pub mod message;
pub mod types;

pub use client::ConnectionClient;
pub use manager::ConnectionManager;
pub use types::{ConnectionEvent, ConnectionEventKind, ConnectionState, MessageSink};
