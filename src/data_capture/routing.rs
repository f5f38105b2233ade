use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::data_capture::types::RoutingSummary;
use crate::network::types::ConnectionEvent;

/// What a route did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Applied,
    Skipped,
    Failed,
}

/// A consumer of connection events.
#[async_trait]
pub trait Route: Send + Sync {
    fn name(&self) -> &str;

    async fn route(&self, event: &ConnectionEvent) -> Routed;
}

/// Feeds `events` into `route` until the channel closes or `cancel` fires.
pub async fn run_route<R: Route + ?Sized>(
    route: &R,
    mut events: broadcast::Receiver<ConnectionEvent>,
    cancel: CancellationToken,
) -> RoutingSummary {
    let mut summary = RoutingSummary::default();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match route.route(&event).await {
                Routed::Applied => summary.applied += 1,
                Routed::Skipped => summary.skipped += 1,
                Routed::Failed => summary.failed += 1,
            },
            Err(RecvError::Lagged(missed)) => {
                warn!("[{}] Fell behind, {} event(s) dropped", route.name(), missed);
                summary.lagged += missed;
            }
            Err(RecvError::Closed) => {
                debug!("[{}] Event channel closed", route.name());
                break;
            }
        }
    }
    info!(
        "[{}] Routing stopped: applied={}, skipped={}, failed={}, lagged={}",
        route.name(),
        summary.applied,
        summary.skipped,
        summary.failed,
        summary.lagged
    );
    summary
}
