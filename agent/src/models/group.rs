//! Group and media models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AgentError;

/// Content type assumed when a media asset does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// How long an image stays on screen when no duration is declared
pub const DEFAULT_IMAGE_DURATION_MS: i64 = 10_000;

/// Desired content assignment for a group of terminals (`groups/{id}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Ordered playlist
    #[serde(default)]
    pub media: Vec<MediaAsset>,
}

impl GroupRecord {
    /// Decode a group document delivered by the store
    pub fn from_document(id: &str, document: Value) -> Result<Self, AgentError> {
        let mut record: GroupRecord = serde_json::from_value(document)?;
        if record.id.is_empty() {
            record.id = id.to_string();
        }
        Ok(record)
    }
}

/// One piece of content to display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: String,

    pub url: String,

    /// MIME type, or the generic `video` / `image`
    #[serde(rename = "type", default)]
    pub content_type: Option<String>,

    /// Display time in seconds, as a number or a numeric string
    #[serde(default)]
    pub duration: Option<Value>,
}

impl MediaAsset {
    pub fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub fn is_video(&self) -> bool {
        let content_type = self.content_type();
        content_type == "video" || content_type.starts_with("video/")
    }

    /// Declared duration in whole seconds, if it parses
    pub fn duration_secs(&self) -> Option<i64> {
        match self.duration.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// On-screen time in milliseconds; videos play to the end (`-1`)
    pub fn display_duration_ms(&self) -> i64 {
        if self.is_video() {
            return -1;
        }
        self.duration_secs()
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(DEFAULT_IMAGE_DURATION_MS)
    }
}
