//! Sync coordinator
//!
//! Turns command flags raised by the watcher into actions. At most one sync
//! runs at a time, syncs closer together than `min_sync_interval` are
//! dropped, and remote flags are always cleared before acting on them.
//!
//! Every `status` write goes through the status lock. Writers that decide on
//! a status from [`SyncCoordinator::phase`] hold it across the decision and
//! the write, so a stale decision can never land after a newer status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::media::{MediaCache, ReconcileReport};
use crate::errors::AgentError;
use crate::models::device::{CommandFlags, DeviceStatus};
use crate::store::{DocRef, DocumentStore};
use crate::sync::{PageRefresher, Rebooter};
use crate::watcher::WatchedState;

/// Coordinator options
#[derive(Debug, Clone)]
pub struct Options {
    /// Minimum time between the starts of two accepted syncs
    pub min_sync_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_sync_interval: Duration::from_secs(5),
        }
    }
}

/// What the coordinator is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Rebooting,
}

/// Result of handling one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Rebooted,
    Synced,
    RateLimited,
    AlreadyRunning,
    Idle,
    /// The coordinator was closed for shutdown
    Closed,
}

/// Sync bookkeeping
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Start of the last successful sync, used for rate limiting
    pub last_sync_at: Option<Instant>,

    /// Wall clock time of the last successful sync
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Consecutive failed syncs
    pub err_streak: u32,

    /// Report of the last completed reconcile
    pub last_report: Option<ReconcileReport>,
}

/// Runs sync and reboot commands for the device
pub struct SyncCoordinator {
    store: Arc<dyn DocumentStore>,
    device_doc: DocRef,
    watched: Arc<WatchedState>,
    cache: Arc<MediaCache>,
    refresher: Arc<dyn PageRefresher>,
    rebooter: Arc<dyn Rebooter>,
    options: Options,
    in_flight: Arc<Mutex<()>>,
    status_lock: Mutex<()>,
    rebooting: AtomicBool,
    closed: AtomicBool,
    state: StdMutex<SyncState>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        device_doc: DocRef,
        watched: Arc<WatchedState>,
        cache: Arc<MediaCache>,
        refresher: Arc<dyn PageRefresher>,
        rebooter: Arc<dyn Rebooter>,
        options: Options,
    ) -> Self {
        Self {
            store,
            device_doc,
            watched,
            cache,
            refresher,
            rebooter,
            options,
            in_flight: Arc::new(Mutex::new(())),
            status_lock: Mutex::new(()),
            rebooting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: StdMutex::new(SyncState::default()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        if self.rebooting.load(Ordering::SeqCst) {
            SyncPhase::Rebooting
        } else if self.in_flight.try_lock().is_err() {
            SyncPhase::Syncing
        } else {
            SyncPhase::Idle
        }
    }

    pub fn get_state(&self) -> SyncState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Serialize a phase-dependent status write with the coordinator's own
    pub async fn lock_status(&self) -> MutexGuard<'_, ()> {
        self.status_lock.lock().await
    }

    /// Resolve once no sync holds the single-flight lock
    pub async fn wait_idle(&self) {
        let _guard = self.in_flight.lock().await;
    }

    /// Refuse further commands and wait for an in-flight sync to finish.
    ///
    /// After this returns the coordinator writes nothing more to the device
    /// record.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
        info!("Sync coordinator closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handle the command flags of one device delivery.
    ///
    /// A reboot request wins over a sync request carried by the same flags.
    pub async fn on_command(
        &self,
        flags: CommandFlags,
        now: Instant,
    ) -> Result<CommandOutcome, AgentError> {
        if self.is_closed() {
            debug!("Coordinator closed, ignoring {:?}", flags);
            return Ok(CommandOutcome::Closed);
        }
        if flags.needs_reboot {
            return self.reboot().await;
        }
        if !flags.needs_sync {
            return Ok(CommandOutcome::Idle);
        }

        if let Some(last_sync_at) = self.get_state().last_sync_at {
            if now.saturating_duration_since(last_sync_at) < self.options.min_sync_interval {
                info!("Sync requested too soon, skipping...");
                return Ok(CommandOutcome::RateLimited);
            }
        }

        let Ok(guard) = self.in_flight.clone().try_lock_owned() else {
            info!("Sync already in progress, skipping...");
            return Ok(CommandOutcome::AlreadyRunning);
        };
        // close() may have drained the lock between the first check and here
        if self.is_closed() {
            debug!("Coordinator closed, ignoring {:?}", flags);
            return Ok(CommandOutcome::Closed);
        }

        let result = self.sync_locked(now).await;
        drop(guard);

        match result {
            Ok(true) => {
                if let Err(e) = self.refresher.refresh().await {
                    warn!("Display was not refreshed after sync: {}", e);
                }
                Ok(CommandOutcome::Synced)
            }
            Ok(false) => Ok(CommandOutcome::Synced),
            Err(e) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.err_streak += 1;
                error!("Sync failed (streak {}): {}", state.err_streak, e);
                Err(e)
            }
        }
    }

    /// Returns whether content was reconciled and the display needs a reload
    async fn sync_locked(&self, now: Instant) -> Result<bool, AgentError> {
        info!("Sync flag detected");
        self.store
            .update(&self.device_doc, json!({ "needsSync": false }))
            .await?;
        self.set_status(DeviceStatus::Syncing).await;

        let Some(group) = self.watched.group() else {
            info!("No group assigned, nothing to sync");
            self.set_status(DeviceStatus::Online).await;
            self.record_success(now, None);
            return Ok(false);
        };

        self.cache.set_cached_group(group.clone()).await;
        let report = match self.cache.reconcile(&group).await {
            Ok(report) => report,
            Err(e) => {
                self.set_status(DeviceStatus::Error).await;
                return Err(AgentError::SyncError(format!(
                    "reconcile of group {} failed: {}",
                    group.id, e
                )));
            }
        };

        if !report.is_converged() {
            warn!(
                "Sync left {} downloads and {} removals for the next pass",
                report.failed.len(),
                report.evict_failed.len()
            );
        }

        let synced_at = Utc::now();
        self.write_status(json!({
            "status": DeviceStatus::Online,
            "lastSync": synced_at.to_rfc3339(),
        }))
        .await;
        info!(
            "Sync of group {} complete: {} downloaded, {} removed, {} kept",
            group.id,
            report.downloaded.len(),
            report.evicted.len(),
            report.kept
        );
        self.record_success(now, Some(report));
        Ok(true)
    }

    fn record_success(&self, now: Instant, report: Option<ReconcileReport>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_sync_at = Some(now);
        state.last_synced_at = Some(Utc::now());
        state.err_streak = 0;
        if report.is_some() {
            state.last_report = report;
        }
    }

    async fn reboot(&self) -> Result<CommandOutcome, AgentError> {
        info!("Reboot flag detected");
        self.store
            .update(&self.device_doc, json!({ "needsReboot": false }))
            .await?;

        {
            let _status = self.lock_status().await;
            self.rebooting.store(true, Ordering::SeqCst);
            self.write(json!({ "status": DeviceStatus::Rebooting })).await;
        }

        if let Err(e) = self.rebooter.reboot().await {
            error!("Error handling reboot command: {}", e);
            let _status = self.lock_status().await;
            self.rebooting.store(false, Ordering::SeqCst);
            self.write(json!({ "status": DeviceStatus::Error })).await;
            return Err(e);
        }
        Ok(CommandOutcome::Rebooted)
    }

    async fn set_status(&self, status: DeviceStatus) {
        debug!("Device status -> {}", status);
        self.write_status(json!({ "status": status })).await;
    }

    async fn write_status(&self, fields: Value) {
        let _status = self.lock_status().await;
        self.write(fields).await;
    }

    async fn write(&self, fields: Value) {
        if let Err(e) = self.store.update(&self.device_doc, fields).await {
            error!("Error updating device record: {}", e);
        }
    }
}
