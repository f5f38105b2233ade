//! Classification of inbound JSON frames by their `type` discriminator.
//!
//! | `type`          | result                                  |
//! |-----------------|-----------------------------------------|
//! | `connected`     | control: server assigned a client id    |
//! | `subscribed`    | control: subscription acknowledged      |
//! | `initial_data`  | `Full` replace with `data`              |
//! | `update`        | `Update` with the `updates` patch list  |
//! | `batch_update`  | `Batch` with the `updates` patch list   |
//! | anything else   | `Passthrough` of the whole frame        |

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Full,
    Update,
    Batch,
    Passthrough,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Full => "full",
            MessageKind::Update => "update",
            MessageKind::Batch => "batch",
            MessageKind::Passthrough => "passthrough",
        }
    }
}

/// A data frame after classification.
///
/// `data_key` is the dataset named by the frame, falling back to the name of
/// the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedMessage {
    pub kind: MessageKind,
    pub data_key: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ServerAssigned { client_id: Option<String> },
    Subscribed { data_key: Option<String> },
    Data(ClassifiedMessage),
}

fn text_field(frame: &Value, field: &str) -> Option<String> {
    frame.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Parses and classifies one frame received on connection `name`.
pub fn classify(name: &str, raw: &str) -> Result<Inbound, serde_json::Error> {
    let frame: Value = serde_json::from_str(raw)?;
    let data_key = text_field(&frame, "dataKey").unwrap_or_else(|| name.to_string());
    let data = |kind: MessageKind, field: &str| {
        Inbound::Data(ClassifiedMessage {
            kind,
            data_key: data_key.clone(),
            payload: frame.get(field).cloned().unwrap_or(Value::Null),
        })
    };

    Ok(match frame.get("type").and_then(Value::as_str) {
        Some("connected") => Inbound::ServerAssigned {
            client_id: text_field(&frame, "clientId"),
        },
        Some("subscribed") => Inbound::Subscribed {
            data_key: text_field(&frame, "dataKey"),
        },
        Some("initial_data") => data(MessageKind::Full, "data"),
        Some("update") => data(MessageKind::Update, "updates"),
        Some("batch_update") => data(MessageKind::Batch, "updates"),
        _ => Inbound::Data(ClassifiedMessage {
            kind: MessageKind::Passthrough,
            data_key: name.to_string(),
            payload: frame.clone(),
        }),
    })
}

/// `{"type":"subscribe","dataKey":name}`
pub fn subscribe_request(name: &str) -> String {
    serde_json::json!({ "type": "subscribe", "dataKey": name }).to_string()
}

/// `{"type":"unsubscribe","dataKey":name}`
pub fn unsubscribe_request(name: &str) -> String {
    serde_json::json!({ "type": "unsubscribe", "dataKey": name }).to_string()
}

/// Outbound publish envelope.
pub fn publish_envelope(name: &str, data: &Value) -> String {
    serde_json::json!({ "type": "publish", "dataKey": name, "data": data }).to_string()
}
