//! Command handling: content sync and reboot

pub mod coordinator;
pub mod reboot;

use async_trait::async_trait;

use crate::errors::AgentError;

/// Restarts the device
#[async_trait]
pub trait Rebooter: Send + Sync {
    async fn reboot(&self) -> Result<(), AgentError>;
}

/// Reloads the locally running display page
#[async_trait]
pub trait PageRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), AgentError>;
}
