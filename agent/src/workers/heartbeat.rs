//! Heartbeat worker
//!
//! Writes `lastHeartbeat` and fresh diagnostics to the device record on a
//! fixed period. The `status` field is only written while no sync or reboot
//! is in progress, so a heartbeat never overwrites `syncing` or `rebooting`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crate::errors::AgentError;
use crate::models::device::DeviceStatus;
use crate::store::{DocRef, DocumentStore};
use crate::sync::coordinator::{SyncCoordinator, SyncPhase};
use crate::telemetry::MetricsProvider;

/// Heartbeat worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between two heartbeats
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Builds and writes heartbeats for one device
pub struct HeartbeatEmitter {
    store: Arc<dyn DocumentStore>,
    device_doc: DocRef,
    metrics: Arc<dyn MetricsProvider>,
    coordinator: Arc<SyncCoordinator>,
}

impl HeartbeatEmitter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        device_doc: DocRef,
        metrics: Arc<dyn MetricsProvider>,
        coordinator: Arc<SyncCoordinator>,
    ) -> Self {
        Self {
            store,
            device_doc,
            metrics,
            coordinator,
        }
    }

    /// Send one heartbeat.
    ///
    /// Diagnostics are omitted when they cannot be gathered; the heartbeat
    /// itself is still written.
    pub async fn beat(&self) -> Result<(), AgentError> {
        let mut fields = Map::new();
        fields.insert("lastHeartbeat".to_string(), json!(Utc::now().to_rfc3339()));

        match self.metrics.collect().await {
            Ok(diagnostics) => {
                fields.insert("diagnostics".to_string(), serde_json::to_value(diagnostics)?);
            }
            Err(e) => error!("Error collecting diagnostics: {}", e),
        }

        // held until the write lands so a sync cannot slip `syncing` in
        // between the phase check and this update
        let _status = self.coordinator.lock_status().await;
        let phase = self.coordinator.phase();
        if phase == SyncPhase::Idle {
            fields.insert("status".to_string(), json!(DeviceStatus::Online));
        } else {
            debug!("Leaving status untouched while {:?}", phase);
        }

        self.store
            .update(&self.device_doc, Value::Object(fields))
            .await
    }
}

/// Run the heartbeat worker
pub async fn run<S, F>(
    options: &Options,
    emitter: &HeartbeatEmitter,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Heartbeat worker starting...");

    loop {
        debug!("Sending heartbeat with diagnostics...");
        match emitter.beat().await {
            Ok(()) => debug!("Heartbeat sent successfully"),
            Err(e) => error!("Error sending heartbeat: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Heartbeat worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
