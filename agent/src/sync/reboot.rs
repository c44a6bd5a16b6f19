//! Device reboot through a system command

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::errors::AgentError;
use crate::sync::Rebooter;

/// Reboots by spawning a command such as `sudo reboot`
#[derive(Debug, Clone)]
pub struct CommandRebooter {
    command: Vec<String>,
}

impl CommandRebooter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Rebooter for CommandRebooter {
    async fn reboot(&self) -> Result<(), AgentError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(AgentError::ConfigError("reboot command is empty".to_string()));
        };

        info!("Initiating device reboot: {}", self.command.join(" "));
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| AgentError::RebootError(format!("failed to spawn {program}: {e}")))?;

        if !status.success() {
            return Err(AgentError::RebootError(format!(
                "{} exited with {}",
                program, status
            )));
        }
        Ok(())
    }
}
