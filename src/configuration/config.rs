use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn default_workspace() -> String {
    "default".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}

fn is_websocket_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

/// Application configuration structure that defines all runtime parameters.
///
/// Loaded from a TOML file with [`Config::from_file`] or from the command
/// line with [`Config::from_args`]; both paths run [`Config::validate`].
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use ws_recorder::configuration::config::Config;
///
/// let config = Config::from_file(Path::new("recorder.toml")).unwrap();
/// println!("Storage path: {:?}", config.storage_path);
/// ```
///
/// # Fields Overview
///
/// - `storage_path`: root data directory; a workspace keeps its catalog and
///   session files under `<storage_path>/sessions/<workspace>/`
/// - `workspace`: workspace opened at startup
/// - `record_url`: feed recorded verbatim by the workspace's client
/// - `connections`: named feeds of the Connection Manager
/// - `reconnect`: backoff and heartbeat timing
/// - `rotation`: traffic table rotation policy
/// - `projection`: in-memory datasets
#[derive(Parser, Deserialize, Debug, Clone, PartialEq)]
#[command(name = "ws-recorder")]
pub struct Config {
    /// File system path for data storage.
    ///
    /// # Command Line
    /// Use `--storage-path <PATH>` to set this value from the CLI
    #[arg(long, default_value = "data")]
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Workspace opened at startup.
    ///
    /// # Command Line
    /// Use `--workspace <KEY>` to set this value from the CLI
    #[arg(long, default_value = "default")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Feed whose raw frames are recorded into the startup workspace.
    ///
    /// # Command Line
    /// Use `--record-url <URL>` to set this value from the CLI
    #[arg(long)]
    #[serde(default)]
    pub record_url: Option<String>,

    /// Managed connections.
    ///
    /// Uses `#[arg(skip)]` to exclude from command line parsing; only the
    /// configuration file can set them
    #[arg(skip)]
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    #[arg(skip)]
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[arg(skip)]
    #[serde(default)]
    pub rotation: RotationConfig,

    #[arg(skip)]
    #[serde(default)]
    pub projection: ProjectionConfig,
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates the process arguments.
    pub fn from_args() -> Result<Self, ConfigError> {
        Self::from_arg_list(std::env::args_os())
    }

    pub fn from_arg_list<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config =
            Config::try_parse_from(args).map_err(|e| ConfigError::InvalidArguments(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Dataset keys of the projection store.
    pub fn dataset_keys(&self) -> Vec<String> {
        if self.projection.datasets.is_empty() {
            self.connections.iter().map(|c| c.name.clone()).collect()
        } else {
            self.projection.datasets.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(ConfigError::DirectoryDoesNotExist(
                "storage_path is empty".to_string(),
            ));
        }
        if self.storage_path.exists() && !self.storage_path.is_dir() {
            return Err(ConfigError::DirectoryDoesNotExist(format!(
                "{} is not a directory",
                self.storage_path.display()
            )));
        }
        if self.workspace.trim().is_empty() {
            return Err(ConfigError::NotInRange(
                "workspace must not be empty".to_string(),
            ));
        }
        if let Some(ref url) = self.record_url {
            if !is_websocket_url(url) {
                return Err(ConfigError::ConnectionsInvalid(format!(
                    "record_url {} is not a ws:// or wss:// url",
                    url
                )));
            }
        }

        let mut names = HashSet::new();
        for connection in &self.connections {
            if connection.name.trim().is_empty() {
                return Err(ConfigError::ConnectionsInvalid(
                    "connection name must not be empty".to_string(),
                ));
            }
            if !names.insert(connection.name.as_str()) {
                return Err(ConfigError::ConnectionsInvalid(format!(
                    "duplicate connection name {}",
                    connection.name
                )));
            }
            if !is_websocket_url(&connection.url) {
                return Err(ConfigError::ConnectionsInvalid(format!(
                    "connection {} has invalid url {}",
                    connection.name, connection.url
                )));
            }
        }

        let reconnect = &self.reconnect;
        if reconnect.base_interval_ms == 0 || reconnect.ping_interval_ms == 0 {
            return Err(ConfigError::NotInRange(
                "reconnect intervals must be greater than zero".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_interval_ms {
            return Err(ConfigError::NotInRange(format!(
                "reconnect max_delay_ms ({}) is below base_interval_ms ({})",
                reconnect.max_delay_ms, reconnect.base_interval_ms
            )));
        }
        if self.projection.batch_size == 0 {
            return Err(ConfigError::NotInRange(
                "projection batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::rotation::{RotationKind, RotationPolicy};
    use std::io::Write;

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recorder.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
storage_path = "{}"
workspace = "lab"
record_url = "ws://127.0.0.1:8080"

[[connections]]
name = "quotes"
url = "ws://127.0.0.1:9000"

[[connections]]
name = "orders"
url = "wss://feed.example/orders"

[reconnect]
base_interval_ms = 1000
max_attempts = 5

[rotation]
kind = "size_based"
max_size = 2048
"#,
            dir.path().display()
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(config.workspace, "lab");
        assert_eq!(config.connections.len(), 2);
        assert_eq!(config.reconnect.base_interval_ms, 1000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.rotation.policy(), RotationPolicy::size_based(2048));
        assert_eq!(config.projection.batch_size, 1000);
        assert_eq!(config.dataset_keys(), vec!["quotes", "orders"]);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.workspace, "default");
        assert_eq!(config.storage_path, PathBuf::from("data"));
        assert_eq!(config.rotation.kind, RotationKind::CountBased);
        assert_eq!(config.rotation.policy(), RotationPolicy::count_based(10_000));
        let settings = config.reconnect.settings();
        assert_eq!(settings.base_interval.as_millis(), 5_000);
        assert_eq!(settings.max_attempts, None);
    }

    #[test]
    fn test_from_args() {
        let config = Config::from_arg_list([
            "ws-recorder",
            "--storage-path",
            "/tmp",
            "--workspace",
            "cli",
            "--record-url",
            "ws://localhost:8080",
        ])
        .unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(config.storage_path, PathBuf::from("/tmp"));
        assert_eq!(config.workspace, "cli");
        assert_eq!(config.record_url.as_deref(), Some("ws://localhost:8080"));
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let duplicate = r#"
[[connections]]
name = "a"
url = "ws://x"
[[connections]]
name = "a"
url = "ws://y"
"#;
        assert!(matches!(
            Config::from_toml(duplicate),
            Err(ConfigError::ConnectionsInvalid(_))
        ));
        assert!(matches!(
            Config::from_toml("record_url = \"http://x\""),
            Err(ConfigError::ConnectionsInvalid(_))
        ));
        assert!(matches!(
            Config::from_toml("[reconnect]\nbase_interval_ms = 0"),
            Err(ConfigError::NotInRange(_))
        ));
        assert!(matches!(
            Config::from_toml("[projection]\nbatch_size = 0"),
            Err(ConfigError::NotInRange(_))
        ));
        assert!(matches!(
            Config::from_toml("workspace = 3"),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_disabled_rotation_flag() {
        let config = Config::from_toml("[rotation]\nenabled = false").unwrap();
        assert!(!config.rotation.policy().enabled);
    }
}
