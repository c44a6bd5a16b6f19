//! Remote state watcher
//!
//! Follows the device record and, while one is assigned, the record of its
//! group. Every delivery replaces the in-memory copy wholesale and is turned
//! into a [`WatchEvent`] on a broadcast channel.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;
use crate::models::device::{CommandFlags, DeviceRecord};
use crate::models::group::GroupRecord;
use crate::store::{DocRef, DocumentStore, SnapshotEvent, Subscription};
use crate::utils::local_ip;

const EVENT_CAPACITY: usize = 64;

/// Events raised by the watcher
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A new copy of the device record arrived
    DeviceUpdated(DeviceRecord),

    /// The assigned group or its contents changed; `None` when unassigned
    GroupChanged(Option<GroupRecord>),

    /// The device record carries `needsSync` and/or `needsReboot`
    CommandReceived(CommandFlags),

    /// A subscription reported a transport failure
    SubscriptionError { doc: DocRef, message: String },
}

/// Latest copies of the watched documents
#[derive(Debug, Default)]
pub struct WatchedState {
    device: RwLock<Option<DeviceRecord>>,
    group: RwLock<Option<GroupRecord>>,
}

impl WatchedState {
    pub fn device(&self) -> Option<DeviceRecord> {
        self.device.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn group(&self) -> Option<GroupRecord> {
        self.group.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_device(&self, device: DeviceRecord) {
        *self.device.write().unwrap_or_else(|e| e.into_inner()) = Some(device);
    }

    fn set_group(&self, group: Option<GroupRecord>) {
        *self.group.write().unwrap_or_else(|e| e.into_inner()) = group;
    }
}

/// Watcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Key of the device record in the `devices` collection
    pub device_key: String,

    /// Pause between detaching from an old group and reading the new one
    pub settle_delay: Duration,

    /// Address announced on open; discovered when unset
    pub device_ip: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device_key: String::new(),
            settle_delay: Duration::from_secs(1),
            device_ip: None,
        }
    }
}

struct GroupListener {
    doc: DocRef,
    task: JoinHandle<()>,
}

impl GroupListener {
    async fn stop(self) {
        debug!("Detaching from {}", self.doc);
        self.task.abort();
        let _ = self.task.await;
    }
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    options: Options,
    state: Arc<WatchedState>,
    events: broadcast::Sender<WatchEvent>,
    group_listener: Mutex<Option<GroupListener>>,
}

impl Shared {
    fn emit(&self, event: WatchEvent) {
        // no receivers is fine, the state copy is still updated
        let _ = self.events.send(event);
    }

    fn emit_error(&self, doc: &DocRef, message: String) {
        warn!("Subscription on {} failed: {}", doc, message);
        self.emit(WatchEvent::SubscriptionError {
            doc: doc.clone(),
            message,
        });
    }

    async fn read_group(&self, group_id: &str) -> Result<Option<GroupRecord>, AgentError> {
        match self.store.get(&DocRef::group(group_id)).await? {
            Some(document) => Ok(Some(GroupRecord::from_document(group_id, document)?)),
            None => {
                warn!("Group {} does not exist", group_id);
                Ok(None)
            }
        }
    }

    async fn attach_group(self: &Arc<Self>, subscription: Subscription) {
        let doc = subscription.doc().clone();
        let task = tokio::spawn(group_listener(self.clone(), subscription));
        info!("Listening to {}", doc);
        *self.group_listener.lock().await = Some(GroupListener { doc, task });
    }

    async fn switch_group(self: &Arc<Self>, group_id: Option<&str>) {
        let previous = self.group_listener.lock().await.take();
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let Some(group_id) = group_id else {
            info!("Device is no longer assigned to a group");
            self.state.set_group(None);
            self.emit(WatchEvent::GroupChanged(None));
            return;
        };

        info!("Group changed to {}, reloading...", group_id);
        tokio::time::sleep(self.options.settle_delay).await;

        let group = match self.read_group(group_id).await {
            Ok(group) => group,
            Err(e) => {
                error!("Error reading group {}: {}", group_id, e);
                None
            }
        };
        self.state.set_group(group.clone());

        let doc = DocRef::group(group_id);
        match self.store.subscribe(&doc).await {
            Ok(subscription) => self.attach_group(subscription).await,
            Err(e) => self.emit_error(&doc, e.to_string()),
        }

        self.emit(WatchEvent::GroupChanged(group));
    }
}

/// Watches the device record and its assigned group
pub struct RemoteStateWatcher {
    shared: Arc<Shared>,
    device_listener: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStateWatcher {
    pub fn new(store: Arc<dyn DocumentStore>, options: Options) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                options,
                state: Arc::new(WatchedState::default()),
                events,
                group_listener: Mutex::new(None),
            }),
            device_listener: Mutex::new(None),
        }
    }

    /// Shared copy of the watched documents
    pub fn state(&self) -> Arc<WatchedState> {
        self.shared.state.clone()
    }

    /// Receive events raised after this call
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.shared.events.subscribe()
    }

    pub fn device_doc(&self) -> DocRef {
        DocRef::device(&self.shared.options.device_key)
    }

    /// Read the device and its group, announce the device as online and
    /// start listening for changes.
    ///
    /// A missing device record is reported as [`AgentError::DeviceNotFound`].
    pub async fn open(&self) -> Result<(DeviceRecord, Option<GroupRecord>), AgentError> {
        let shared = &self.shared;
        let device_key = &shared.options.device_key;
        let device_doc = self.device_doc();

        info!("Initializing device {}...", device_key);
        let Some(document) = shared.store.get(&device_doc).await? else {
            return Err(AgentError::DeviceNotFound(device_key.clone()));
        };
        let device = DeviceRecord::from_document(device_key, document)?;
        info!(
            "Device found: {}",
            device.name.as_deref().unwrap_or("unnamed")
        );

        self.announce(&device_doc).await;

        let group = match device.group_id() {
            Some(group_id) => shared.read_group(group_id).await?,
            None => None,
        };

        let device_subscription = shared.store.subscribe(&device_doc).await?;
        let group_subscription = match device.group_id() {
            Some(group_id) => Some(shared.store.subscribe(&DocRef::group(group_id)).await?),
            None => None,
        };

        shared.state.set_device(device.clone());
        shared.state.set_group(group.clone());

        if let Some(subscription) = group_subscription {
            shared.attach_group(subscription).await;
        }
        let task = tokio::spawn(device_listener(
            shared.clone(),
            device_subscription,
            device.group_id().map(str::to_string),
        ));
        *self.device_listener.lock().await = Some(task);

        Ok((device, group))
    }

    async fn announce(&self, device_doc: &DocRef) {
        let mut fields = Map::new();
        let ip = self
            .shared
            .options
            .device_ip
            .clone()
            .or_else(|| local_ip().map(|ip| ip.to_string()));
        if let Some(ip) = ip {
            fields.insert("ip".to_string(), Value::String(ip));
        }
        fields.insert("status".to_string(), json!("online"));
        fields.insert("lastSeen".to_string(), json!(Utc::now().to_rfc3339()));

        if let Err(e) = self.shared.store.update(device_doc, Value::Object(fields)).await {
            error!("Error announcing device: {}", e);
        }
    }

    /// Detach both subscriptions and stop the listener tasks
    pub async fn close(&self) {
        if let Some(task) = self.device_listener.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        let group = self.shared.group_listener.lock().await.take();
        if let Some(group) = group {
            group.stop().await;
        }
        info!("Watcher closed");
    }
}

async fn device_listener(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    mut group_id: Option<String>,
) {
    let device_key = shared.options.device_key.clone();

    while let Some(event) = subscription.next().await {
        let document = match event {
            SnapshotEvent::Error(message) => {
                shared.emit_error(subscription.doc(), message);
                continue;
            }
            SnapshotEvent::Snapshot { document: None, .. } => {
                warn!("Device record {} was removed remotely", device_key);
                continue;
            }
            SnapshotEvent::Snapshot {
                document: Some(document),
                ..
            } => document,
        };

        let device = match DeviceRecord::from_document(&device_key, document) {
            Ok(device) => device,
            Err(e) => {
                error!("Ignoring malformed device record: {}", e);
                continue;
            }
        };

        let flags = device.command_flags();
        let next_group_id = device.group_id().map(str::to_string);

        shared.state.set_device(device.clone());
        shared.emit(WatchEvent::DeviceUpdated(device));

        // switch before raising commands so a sync sees the new group
        if next_group_id != group_id {
            shared.switch_group(next_group_id.as_deref()).await;
            group_id = next_group_id;
        }

        if flags.any() {
            debug!("Command flags received: {:?}", flags);
            shared.emit(WatchEvent::CommandReceived(flags));
        }
    }

    debug!("Device subscription for {} ended", device_key);
}

async fn group_listener(shared: Arc<Shared>, mut subscription: Subscription) {
    let group_id = subscription.doc().id.clone();

    while let Some(event) = subscription.next().await {
        match event {
            SnapshotEvent::Error(message) => shared.emit_error(subscription.doc(), message),
            SnapshotEvent::Snapshot { document: None, .. } => {
                warn!("Group {} was removed remotely", group_id);
                shared.state.set_group(None);
                shared.emit(WatchEvent::GroupChanged(None));
            }
            SnapshotEvent::Snapshot {
                document: Some(document),
                ..
            } => match GroupRecord::from_document(&group_id, document) {
                Ok(group) => {
                    debug!("Group {} updated ({} media)", group_id, group.media.len());
                    shared.state.set_group(Some(group.clone()));
                    shared.emit(WatchEvent::GroupChanged(Some(group)));
                }
                Err(e) => error!("Ignoring malformed group record: {}", e),
            },
        }
    }

    debug!("Group subscription for {} ended", group_id);
}
