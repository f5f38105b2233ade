use std::sync::Arc;

use async_trait::async_trait;
use log::{trace, warn};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::data_capture::routing::{run_route, Route, Routed};
use crate::data_capture::types::RoutingSummary;
use crate::error_handling::types::ProjectionError;
use crate::network::message::{ClassifiedMessage, MessageKind};
use crate::network::types::{ConnectionEvent, ConnectionEventKind};
use crate::projection::store::ProjectionStore;

/// Drives the projection store from classified connection messages:
/// `full` replaces a dataset, `update` patches it and `batch` patches it in
/// slices of `batch_size`.
pub struct ProjectionFeeder {
    store: Arc<ProjectionStore>,
    batch_size: usize,
}

fn as_items(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    }
}

impl ProjectionFeeder {
    pub fn new(store: Arc<ProjectionStore>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    /// Applies one message. `Ok(false)` when the message kind does not
    /// concern the projection.
    pub fn apply(&self, message: &ClassifiedMessage) -> Result<bool, ProjectionError> {
        let key = message.data_key.as_str();
        match message.kind {
            MessageKind::Full => self.store.set_data(key, as_items(&message.payload))?,
            MessageKind::Update => {
                self.store.handle_update(key, &as_items(&message.payload))?;
            }
            MessageKind::Batch => {
                self.store
                    .batch_update(key, &as_items(&message.payload), self.batch_size)?;
            }
            MessageKind::Passthrough => return Ok(false),
        }
        Ok(true)
    }

    pub fn spawn(
        self: Arc<Self>,
        events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<RoutingSummary> {
        tokio::spawn(async move { run_route(self.as_ref(), events, cancel).await })
    }
}

#[async_trait]
impl Route for ProjectionFeeder {
    fn name(&self) -> &str {
        "projection"
    }

    async fn route(&self, event: &ConnectionEvent) -> Routed {
        let ConnectionEventKind::Message { ref message } = event.kind else {
            return Routed::Skipped;
        };
        match self.apply(message) {
            Ok(true) => {
                trace!("[{}] Projected {} message", event.source, message.kind.as_str());
                Routed::Applied
            }
            Ok(false) => Routed::Skipped,
            Err(ProjectionError::UnknownDataset(key)) => {
                warn!("[{}] No projection dataset {}", event.source, key);
                Routed::Skipped
            }
            Err(e) => {
                warn!("[{}] Projection failed: {}", event.source, e);
                Routed::Failed
            }
        }
    }
}
