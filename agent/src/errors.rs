//! Error types for the display agent

use thiserror::Error;

/// Main error type for the display agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Browser refresh error: {0}")]
    RefreshError(String),

    #[error("Reboot error: {0}")]
    RebootError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether the error must stop the agent during startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::DeviceNotFound(_) | AgentError::ConfigError(_))
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
