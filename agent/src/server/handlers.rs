//! HTTP request handlers

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::naming::derive_filename;
use crate::models::device::CommandFlags;
use crate::models::group::MediaAsset;
use crate::server::state::ServerState;
use crate::sync::coordinator::CommandOutcome;
use crate::utils::version_info;

/// URL prefix under which cached media files are served
pub const MEDIA_URL_PREFIX: &str = "/static/media";

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "signagent".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Device info response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub id: String,
    pub name: Option<String>,
    pub group_id: Option<String>,
    pub status: Option<String>,
    pub phase: String,
    pub last_synced_at: Option<String>,
}

/// Device info handler
pub async fn device_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, StatusCode> {
    let device = state.watched.device().ok_or(StatusCode::NOT_FOUND)?;
    let sync_state = state.coordinator.get_state();

    Ok(Json(DeviceResponse {
        group_id: device.group_id().map(str::to_string),
        id: device.id,
        name: device.name,
        status: device.status.map(|s| s.to_string()),
        phase: format!("{:?}", state.coordinator.phase()).to_lowercase(),
        last_synced_at: sync_state.last_synced_at.map(|at| at.to_rfc3339()),
    }))
}

/// One media entry as the display page consumes it
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub local_path: String,
    pub is_video: bool,
    /// Milliseconds on screen, -1 to play videos to the end
    pub duration: i64,
    /// Whether the file is present in the cache
    pub cached: bool,
}

impl MediaItem {
    fn from_asset(asset: &MediaAsset, cached: bool) -> Self {
        Self {
            id: asset.id.clone(),
            url: asset.url.clone(),
            content_type: asset.content_type().to_string(),
            local_path: format!("{}/{}", MEDIA_URL_PREFIX, derive_filename(asset)),
            is_video: asset.is_video(),
            duration: asset.display_duration_ms(),
            cached,
        }
    }
}

/// Media list response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaResponse {
    pub configured: bool,
    pub group_id: Option<String>,
    pub media: Vec<MediaItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Media of the cached group handler
pub async fn media_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let Some(group) = state.cache.cached_group() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(MediaResponse {
                configured: false,
                group_id: None,
                media: Vec::new(),
                error: Some("Device not configured".to_string()),
            }),
        );
    };

    let cached = state.cache.media_dir().file_names().await.unwrap_or_default();
    let media = group
        .media
        .iter()
        .map(|asset| MediaItem::from_asset(asset, cached.contains(&derive_filename(asset))))
        .collect();

    (
        StatusCode::OK,
        Json(MediaResponse {
            configured: true,
            group_id: Some(group.id),
            media,
            error: None,
        }),
    )
}

/// Sync response
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub outcome: Option<String>,
    pub message: String,
}

/// Local manual sync handler
pub async fn sync_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now())
        .await
    {
        Ok(outcome) => Json(SyncResponse {
            success: matches!(outcome, CommandOutcome::Synced),
            outcome: Some(format!("{:?}", outcome)),
            message: match outcome {
                CommandOutcome::Synced => "Sync completed successfully".to_string(),
                CommandOutcome::RateLimited => "Sync requested too soon".to_string(),
                CommandOutcome::AlreadyRunning => "Sync already in progress".to_string(),
                other => format!("Sync not performed: {:?}", other),
            },
        }),
        Err(e) => Json(SyncResponse {
            success: false,
            outcome: None,
            message: format!("Sync failed: {}", e),
        }),
    }
}
