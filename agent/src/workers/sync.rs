//! Sync worker: hands watcher commands to the coordinator
//!
//! Each command runs on its own task so the event stream keeps draining while
//! a reconcile is in progress; the coordinator turns overlapping commands
//! into no-ops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::sync::coordinator::SyncCoordinator;
use crate::watcher::WatchEvent;

/// Run the sync worker
pub async fn run(
    coordinator: Arc<SyncCoordinator>,
    mut events: broadcast::Receiver<WatchEvent>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Sync worker starting...");

    loop {
        let event = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Sync worker shutting down...");
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(WatchEvent::CommandReceived(flags)) => {
                let received_at = Instant::now();
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    match coordinator.on_command(flags, received_at).await {
                        Ok(outcome) => debug!("Command {:?} handled: {:?}", flags, outcome),
                        Err(e) => error!("Command {:?} failed: {}", flags, e),
                    }
                });
            }
            Ok(WatchEvent::SubscriptionError { doc, message }) => {
                warn!("Remote updates for {} interrupted: {}", doc, message);
            }
            Ok(WatchEvent::GroupChanged(group)) => match group {
                Some(group) => info!("Group {} has {} media", group.id, group.media.len()),
                None => info!("No group assigned"),
            },
            Ok(WatchEvent::DeviceUpdated(_)) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!("Sync worker missed {} watcher events", missed);
            }
            Err(RecvError::Closed) => {
                info!("Watcher event stream closed, sync worker stopping...");
                return;
            }
        }
    }
}
