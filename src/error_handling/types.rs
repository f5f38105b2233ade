use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    ConnectionsInvalid(String),
    DirectoryDoesNotExist(String),
    NotInRange(String),
    InvalidArguments(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::ConnectionsInvalid(e) => write!(f, "Connections configuration error: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::InvalidArguments(e) => write!(f, "Invalid arguments: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Result of statically validating a schema description.
///
/// Carries every problem found, in declaration order, so callers can report
/// them all at once before any DDL is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub errors: Vec<String>,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid schema: {}", self.errors.join("; "))
    }
}

impl std::error::Error for SchemaError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    NotConfigured(String),
    Disabled(String),
}

impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationError::NotConfigured(t) => {
                write!(f, "Table {} has no rotation policy registered", t)
            }
            RotationError::Disabled(t) => write!(f, "Rotation is disabled for table {}", t),
        }
    }
}

impl std::error::Error for RotationError {}

#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed(String),
    WriteFailed(String),
    ReadFailed(String),
    InvalidIdentifier(String),
    EmptyRecord(String),
    MissingConditions(String),
    Io(std::io::Error),
    Schema(SchemaError),
    Rotation(RotationError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(e) => write!(f, "Storage connection failed: {}", e),
            StorageError::WriteFailed(e) => write!(f, "Storage write failed: {}", e),
            StorageError::ReadFailed(e) => write!(f, "Storage read failed: {}", e),
            StorageError::InvalidIdentifier(e) => write!(f, "Invalid SQL identifier: {:?}", e),
            StorageError::EmptyRecord(t) => {
                write!(f, "Refusing to insert a record without columns into {}", t)
            }
            StorageError::MissingConditions(t) => {
                write!(f, "Refusing an unconditioned statement on {}", t)
            }
            StorageError::Io(e) => write!(f, "Storage IO error: {}", e),
            StorageError::Schema(e) => write!(f, "{}", e),
            StorageError::Rotation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<SchemaError> for StorageError {
    fn from(err: SchemaError) -> Self {
        StorageError::Schema(err)
    }
}

impl From<RotationError> for StorageError {
    fn from(err: RotationError) -> Self {
        StorageError::Rotation(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Errors raised by the session store.
///
/// `AlreadyActive` and `NoActiveSession` are the state errors: the operation
/// is invalid for the current session state and nothing was changed.
#[derive(Debug)]
pub enum SessionError {
    AlreadyActive(String),
    NoActiveSession,
    InvalidSessionId(String),
    InvalidStatus(String),
    InvalidTransition { from: String, to: String },
    NotFound(String),
    StorageError(StorageError),
}

impl SessionError {
    pub fn is_state_error(&self) -> bool {
        matches!(self, SessionError::AlreadyActive(_) | SessionError::NoActiveSession)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyActive(id) => write!(
                f,
                "Session {} is already active, close it before creating another",
                id
            ),
            SessionError::NoActiveSession => write!(f, "No active session"),
            SessionError::InvalidSessionId(id) => write!(f, "Invalid session id: {}", id),
            SessionError::InvalidStatus(s) => write!(f, "Unknown session status: {}", s),
            SessionError::InvalidTransition { from, to } => {
                write!(f, "Session status cannot change from {} to {}", from, to)
            }
            SessionError::NotFound(id) => write!(f, "Session {} not found", id),
            SessionError::StorageError(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::StorageError(err)
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    InvalidUrl(String),
    ConnectFailed(String),
    SendFailed(String),
    NotConnected(String),
    Protocol(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidUrl(e) => write!(f, "Invalid connection url: {}", e),
            ConnectionError::ConnectFailed(e) => write!(f, "Connection failed: {}", e),
            ConnectionError::SendFailed(e) => write!(f, "Send failed: {}", e),
            ConnectionError::NotConnected(name) => write!(f, "Connection {} is not open", name),
            ConnectionError::Protocol(e) => write!(f, "WebSocket protocol error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectionError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    UnknownDataset(String),
    DatasetMismatch { expected: String, found: String },
    InvalidBatchSize,
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionError::UnknownDataset(key) => write!(f, "Dataset {} does not exist", key),
            ProjectionError::DatasetMismatch { expected, found } => write!(
                f,
                "Dataset key mismatch on import: expected {}, found {}",
                expected, found
            ),
            ProjectionError::InvalidBatchSize => write!(f, "Batch size must be greater than zero"),
        }
    }
}

impl std::error::Error for ProjectionError {}

#[derive(Debug)]
pub enum WorkspaceError {
    NotFound(String),
    SessionError(SessionError),
    ConnectionError(ConnectionError),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::NotFound(key) => write!(f, "Workspace {} not found", key),
            WorkspaceError::SessionError(e) => write!(f, "Session error: {}", e),
            WorkspaceError::ConnectionError(e) => write!(f, "Connection error: {}", e),
        }
    }
}

impl std::error::Error for WorkspaceError {}

impl From<SessionError> for WorkspaceError {
    fn from(err: SessionError) -> Self {
        WorkspaceError::SessionError(err)
    }
}

impl From<ConnectionError> for WorkspaceError {
    fn from(err: ConnectionError) -> Self {
        WorkspaceError::ConnectionError(err)
    }
}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    SessionError(SessionError),
    WorkspaceError(WorkspaceError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::SessionError(e) => write!(f, "Session error: {}", e),
            ControllerError::WorkspaceError(e) => write!(f, "Workspace error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<WorkspaceError> for ControllerError {
    fn from(err: WorkspaceError) -> Self {
        ControllerError::WorkspaceError(err)
    }
}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<SessionError> for ControllerError {
    fn from(err: SessionError) -> Self {
        ControllerError::SessionError(err)
    }
}
