use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configuration::config::Config;
use crate::data_capture::{ProjectionFeeder, RoutingSummary, TrafficRecorder};
use crate::error_handling::types::*;
use crate::network::manager::ConnectionManager;
use crate::network::types::ConnectionSpec;
use crate::projection::store::ProjectionStore;
use crate::session_management::workspace::{WorkspaceSettings, Workspaces};

#[derive(Default)]
struct Tasks {
    routes: Vec<JoinHandle<RoutingSummary>>,
    forwarders: Vec<JoinHandle<()>>,
}

/// Owns every component of a running recorder.
///
/// The startup workspace records the managed connections' messages and,
/// when `record_url` is set, the raw frames of its own client. Managed
/// connections also feed the projection store.
pub struct Controller {
    pub config: Config,
    workspaces: Arc<Workspaces>,
    connections: Arc<ConnectionManager>,
    projection: Arc<ProjectionStore>,
    cancel: CancellationToken,
    tasks: Mutex<Tasks>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate()?;
        info!("Creating controller for workspace {}", config.workspace);

        let reconnect = config.reconnect.settings();
        let workspaces = Workspaces::new(WorkspaceSettings {
            storage_path: config.storage_path.clone(),
            rotation_policy: config.rotation.policy(),
            reconnect,
        });
        let projection = ProjectionStore::new(config.dataset_keys());

        Ok(Self {
            workspaces: Arc::new(workspaces),
            connections: Arc::new(ConnectionManager::new(reconnect)),
            projection: Arc::new(projection),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
            config,
        })
    }

    pub fn workspaces(&self) -> &Arc<Workspaces> {
        &self.workspaces
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn projection(&self) -> &Arc<ProjectionStore> {
        &self.projection
    }

    /// Opens the startup workspace, begins a session and starts every
    /// connection. Returns the id of the new session.
    pub async fn start(&self) -> Result<String, ControllerError> {
        let workspace = self.config.workspace.as_str();
        let store = self.workspaces.open_workspace(workspace).await?;
        let session_id = store.create_session(None).await?;
        info!("[{}] Recording into session {}", workspace, session_id);

        {
            let mut tasks = self.tasks.lock().await;
            let recorder = Arc::new(TrafficRecorder::new(store));
            tasks
                .routes
                .push(recorder.spawn(self.connections.subscribe(), self.cancel.child_token()));
            let feeder = Arc::new(ProjectionFeeder::new(
                self.projection.clone(),
                self.config.projection.batch_size,
            ));
            tasks
                .routes
                .push(feeder.spawn(self.connections.subscribe(), self.cancel.child_token()));
            tasks
                .forwarders
                .push(self.workspaces.forward_projection(&self.projection));
        }

        let specs: Vec<ConnectionSpec> = self.config.connections.iter().map(Into::into).collect();
        self.connections.init_connections(&specs).await;

        if let Some(ref url) = self.config.record_url {
            self.workspaces.start_connection(workspace, url).await?;
        }
        Ok(session_id)
    }

    /// Runs until ctrl-c or [`Controller::stop`], then shuts down.
    pub async fn run(&self) -> Result<(), ControllerError> {
        self.start().await?;
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Unable to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
            }
            _ = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
        Ok(())
    }

    /// Makes a pending [`Controller::run`] return.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(&self) {
        self.connections.close_all().await;
        self.workspaces.shutdown().await;
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks.routes {
            match task.await {
                Ok(summary) => info!(
                    "Route finished: {} applied, {} skipped, {} failed, {} lagged",
                    summary.applied, summary.skipped, summary.failed, summary.lagged
                ),
                Err(e) => warn!("Route task failed: {}", e),
            }
        }
        for task in tasks.forwarders {
            if let Err(e) = task.await {
                warn!("Forwarder task failed: {}", e);
            }
        }
        info!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::ConnectionConfig;
    use crate::session_management::SessionStatus;
    use crate::storage::session_filter::SessionFilter;

    fn config(dir: &std::path::Path) -> Config {
        Config::from_toml(&format!(
            "storage_path = \"{}\"\nworkspace = \"unit\"",
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.connections.push(ConnectionConfig {
            name: "feed".into(),
            url: "http://localhost".into(),
        });
        assert!(matches!(
            Controller::new(config),
            Err(ControllerError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let controller = Controller::new(config(dir.path())).unwrap();

        let session_id = controller.start().await.unwrap();
        assert!(session_id.starts_with("session_"));
        assert_eq!(controller.workspaces().check_connection("unit").await, "disconnected");

        controller.shutdown().await;

        let store = crate::session_management::session_manager::SessionManager::open(
            "unit",
            dir.path(),
            Default::default(),
        )
        .await
        .unwrap();
        let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, session_id);
        assert_ne!(sessions[0].status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_run_returns_after_stop() {
        let dir = tempfile::TempDir::new().unwrap();
        let controller = Arc::new(Controller::new(config(dir.path())).unwrap());
        let running = controller.clone();
        let handle = tokio::spawn(async move { running.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        controller.stop();
        handle.await.unwrap().unwrap();
    }
}
