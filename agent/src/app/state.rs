//! Application state management

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::cache::fetch::BlobFetcher;
use crate::cache::media::MediaCache;
use crate::errors::AgentError;
use crate::models::device::DeviceStatus;
use crate::store::DocumentStore;
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::{PageRefresher, Rebooter};
use crate::telemetry::MetricsProvider;
use crate::watcher::RemoteStateWatcher;
use crate::workers::heartbeat::HeartbeatEmitter;

/// External collaborators the agent is wired with
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub fetcher: Arc<dyn BlobFetcher>,
    pub refresher: Arc<dyn PageRefresher>,
    pub rebooter: Arc<dyn Rebooter>,
    pub metrics: Arc<dyn MetricsProvider>,
}

/// Main application state
pub struct AppState {
    /// Remote document store
    pub store: Arc<dyn DocumentStore>,

    /// Device and group watcher
    pub watcher: Arc<RemoteStateWatcher>,

    /// Local media files
    pub cache: Arc<MediaCache>,

    /// Sync and reboot commands
    pub coordinator: Arc<SyncCoordinator>,

    /// Heartbeat writer
    pub heartbeat: Arc<HeartbeatEmitter>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(
        options: &AppOptions,
        collaborators: Collaborators,
    ) -> Result<Self, AgentError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let store = collaborators.store;

        let cache = Arc::new(MediaCache::new(&options.layout, collaborators.fetcher));
        cache.load().await;

        let watcher = Arc::new(RemoteStateWatcher::new(
            store.clone(),
            options.watcher.clone(),
        ));

        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            watcher.device_doc(),
            watcher.state(),
            cache.clone(),
            collaborators.refresher,
            collaborators.rebooter,
            options.coordinator.clone(),
        ));

        let heartbeat = Arc::new(HeartbeatEmitter::new(
            store.clone(),
            watcher.device_doc(),
            collaborators.metrics,
            coordinator.clone(),
        ));

        Ok(Self {
            store,
            watcher,
            cache,
            coordinator,
            heartbeat,
        })
    }

    /// Stop listening, let an in-flight sync finish, refuse later commands
    /// and report the device offline
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");

        self.watcher.close().await;
        self.coordinator.close().await;

        if self.watcher.state().device().is_some() {
            let offline = json!({ "status": DeviceStatus::Offline });
            match self.store.update(&self.watcher.device_doc(), offline).await {
                Ok(()) => info!("Device marked offline"),
                Err(e) => error!("Error marking device offline: {}", e),
            }
        }

        self.store.close().await;
        Ok(())
    }
}
