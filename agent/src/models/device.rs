//! Device record models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AgentError;

/// Device status as stored on the device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Syncing,
    Rebooting,
    Error,
    #[serde(other)]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Syncing => "syncing",
            DeviceStatus::Rebooting => "rebooting",
            DeviceStatus::Error => "error",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote-authoritative device state (`devices/{id}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Document ID, filled from the document key when absent in the body
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub group_id: Option<String>,

    #[serde(default)]
    pub status: Option<DeviceStatus>,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub needs_sync: bool,

    #[serde(default)]
    pub needs_reboot: bool,

    #[serde(default)]
    pub last_heartbeat: Option<Value>,

    #[serde(default)]
    pub last_sync: Option<Value>,

    #[serde(default)]
    pub diagnostics: Option<Value>,
}

impl DeviceRecord {
    /// Decode a device document delivered by the store
    pub fn from_document(id: &str, document: Value) -> Result<Self, AgentError> {
        let mut record: DeviceRecord = serde_json::from_value(document)?;
        if record.id.is_empty() {
            record.id = id.to_string();
        }
        Ok(record)
    }

    /// Assigned group, treating an empty string as unassigned
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// Pending operator commands carried by this record
    pub fn command_flags(&self) -> CommandFlags {
        CommandFlags {
            needs_sync: self.needs_sync,
            needs_reboot: self.needs_reboot,
        }
    }
}

/// Operator commands raised through the device record flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    pub needs_sync: bool,
    pub needs_reboot: bool,
}

impl CommandFlags {
    pub fn sync() -> Self {
        Self {
            needs_sync: true,
            needs_reboot: false,
        }
    }

    pub fn any(&self) -> bool {
        self.needs_sync || self.needs_reboot
    }
}
