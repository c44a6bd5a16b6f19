//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::{AppState, Collaborators};
use crate::browser::refresh::BrowserRefreshClient;
use crate::cache::fetch::HttpFetcher;
use crate::errors::AgentError;
use crate::models::device::DeviceRecord;
use crate::models::group::GroupRecord;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::store::mqtt::MqttSubscriber;
use crate::store::remote::RemoteStore;
use crate::store::rest::RestStore;
use crate::store::DocumentStore;
use crate::sync::reboot::CommandRebooter;
use crate::telemetry::SysinfoMetrics;
use crate::utils::{calc_exp_backoff, CooldownOptions};
use crate::watcher::WatchEvent;
use crate::workers::{heartbeat, sync};

/// Run the display agent against the configured control plane
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    let collaborators = build_collaborators(&options)?;
    run_with(options, collaborators, shutdown_signal).await
}

/// Run the display agent with the given collaborators
pub async fn run_with(
    options: AppOptions,
    collaborators: Collaborators,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing display agent...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, collaborators, shutdown_tx.clone(), &mut shutdown_manager).await
    {
        error!("Failed to start agent: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

fn build_collaborators(options: &AppOptions) -> Result<Collaborators, AgentError> {
    let api_key = options
        .store
        .api_key
        .as_ref()
        .map(|key| key.expose_secret().to_string());
    let rest = RestStore::new(
        &options.store.base_url,
        api_key.clone().map(SecretString::from),
    )?;

    let push = if options.store.mqtt_broker.host.is_empty() {
        None
    } else {
        let client_id = format!("signagent-{}", options.watcher.device_key);
        Some(MqttSubscriber::connect(
            &options.store.mqtt_broker,
            &client_id,
            &options.watcher.device_key,
            api_key.as_deref(),
        )?)
    };

    let store = RemoteStore::new(rest, push, options.store.poll_interval);

    Ok(Collaborators {
        store: Arc::new(store),
        fetcher: Arc::new(HttpFetcher::new(Duration::from_secs(10))?),
        refresher: Arc::new(BrowserRefreshClient::new(options.browser.clone())?),
        rebooter: Arc::new(CommandRebooter::new(options.reboot_command.clone())),
        metrics: Arc::new(SysinfoMetrics::new(options.agent_version.clone())),
    })
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    collaborators: Collaborators,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, AgentError> {
    let app_state = Arc::new(AppState::init(options, collaborators).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    // subscribe before opening so commands carried by the first device
    // snapshot reach the sync worker
    let events = app_state.watcher.subscribe();

    let (device, group) = open_watcher(&app_state, &options.lifecycle).await?;
    info!(
        "Watching device {} (group: {})",
        device.id,
        device.group_id().unwrap_or("none")
    );

    initial_reconcile(&app_state, group).await;

    init_sync_worker(app_state.clone(), events, shutdown_manager, shutdown_tx.subscribe())?;

    init_heartbeat_worker(
        options.heartbeat.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_server {
        init_local_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(app_state)
}

async fn open_watcher(
    app_state: &AppState,
    lifecycle: &LifecycleOptions,
) -> Result<(DeviceRecord, Option<GroupRecord>), AgentError> {
    let cooldown = CooldownOptions::default();
    let mut attempt = 0;

    loop {
        match app_state.watcher.open().await {
            Ok(opened) => return Ok(opened),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if attempt + 1 >= lifecycle.max_open_attempts => return Err(e),
            Err(e) => {
                let wait = calc_exp_backoff(&cooldown, attempt);
                warn!("Failed to open device record, retrying in {:?}: {}", wait, e);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

async fn initial_reconcile(app_state: &AppState, group: Option<GroupRecord>) {
    let Some(group) = group else {
        info!("No group assigned, skipping initial sync");
        return;
    };

    app_state.cache.set_cached_group(group.clone()).await;
    match app_state.cache.reconcile(&group).await {
        Ok(report) => info!(
            "Initial sync: {} downloaded, {} removed, {} failed",
            report.downloaded.len(),
            report.evicted.len(),
            report.failed.len()
        ),
        Err(e) => error!("Initial sync failed: {}", e),
    }
}

fn init_sync_worker(
    app_state: Arc<AppState>,
    events: broadcast::Receiver<WatchEvent>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing sync worker...");

    let coordinator = app_state.coordinator.clone();
    let sync_handle = tokio::spawn(async move {
        sync::run(
            coordinator,
            events,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_sync_worker_handle(sync_handle)
}

fn init_heartbeat_worker(
    options: heartbeat::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing heartbeat worker...");

    let emitter = app_state.heartbeat.clone();
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat::run(
            &options,
            emitter.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_heartbeat_worker_handle(heartbeat_handle)
}

async fn init_local_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(
        app_state.watcher.state(),
        app_state.cache.clone(),
        app_state.coordinator.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), AgentError>>>,
    sync_worker_handle: Option<JoinHandle<()>>,
    heartbeat_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            sync_worker_handle: None,
            heartbeat_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), AgentError> {
        if self.app_state.is_some() {
            return Err(AgentError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_sync_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.sync_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("sync_handle already set".to_string()));
        }
        self.sync_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_heartbeat_worker_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), AgentError> {
        if self.heartbeat_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("heartbeat_handle already set".to_string()));
        }
        self.heartbeat_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.server_handle.is_some() {
            return Err(AgentError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down display agent...");

        // 1. Sync worker
        if let Some(handle) = self.sync_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 2. Heartbeat worker
        if let Some(handle) = self.heartbeat_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 3. Local server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 4. Watcher, in-flight sync and offline status
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
