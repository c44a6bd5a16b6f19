//! Server state

use std::sync::Arc;

use crate::cache::media::MediaCache;
use crate::sync::coordinator::SyncCoordinator;
use crate::watcher::WatchedState;

/// Server state shared across handlers
pub struct ServerState {
    pub watched: Arc<WatchedState>,
    pub cache: Arc<MediaCache>,
    pub coordinator: Arc<SyncCoordinator>,
}

impl ServerState {
    pub fn new(
        watched: Arc<WatchedState>,
        cache: Arc<MediaCache>,
        coordinator: Arc<SyncCoordinator>,
    ) -> Self {
        Self {
            watched,
            cache,
            coordinator,
        }
    }
}
