//! Fakes and fixtures shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{broadcast, Semaphore};

use signagent::cache::fetch::BlobFetcher;
use signagent::cache::media::MediaCache;
use signagent::errors::AgentError;
use signagent::storage::layout::StorageLayout;
use signagent::store::memory::MemoryStore;
use signagent::store::DocRef;
use signagent::sync::coordinator::{self, SyncCoordinator};
use signagent::sync::{PageRefresher, Rebooter};
use signagent::telemetry::{
    Diagnostics, DiskUsage, MemoryUsage, MetricsProvider, NetworkStats, WifiInfo,
};
use signagent::watcher::{self, RemoteStateWatcher, WatchEvent};

pub const DEVICE_KEY: &str = "lobby-1";

// ================================= FAKES ======================================== //

/// Serves canned bodies keyed by URL; unknown URLs fail
#[derive(Default)]
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits for a permit on the returned semaphore
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (fetcher, gate)
    }

    pub fn serve(&self, url: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_vec());
    }

    pub fn unserve(&self, url: &str) {
        self.bodies.lock().unwrap().remove(url);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, AgentError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let body = self.bodies.lock().unwrap().get(url).cloned();
        let Some(body) = body else {
            return Err(AgentError::DownloadError(format!("GET {url} returned 404")));
        };
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

#[derive(Default)]
pub struct FakeRefresher {
    calls: AtomicU32,
    fail: AtomicBool,
}

impl FakeRefresher {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PageRefresher for FakeRefresher {
    async fn refresh(&self) -> Result<(), AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::RefreshError("debugger unreachable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRebooter {
    calls: AtomicU32,
    fail: AtomicBool,
}

impl FakeRebooter {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Rebooter for FakeRebooter {
    async fn reboot(&self) -> Result<(), AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::RebootError("sudo exited with 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMetrics {
    fail: AtomicBool,
}

impl FakeMetrics {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn collect(&self) -> Result<Diagnostics, AgentError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("sensors unavailable".to_string()));
        }
        Ok(Diagnostics {
            timestamp: "2024-05-01T12:00:00+00:00".to_string(),
            uptime: 3600,
            memory: MemoryUsage {
                total: 4_000,
                available: 3_000,
                used: 1_000,
                free: 2_500,
                percent: 25.0,
            },
            cpu: 12.5,
            disk: DiskUsage {
                total: 100,
                used: 40,
                free: 60,
                percent: 40.0,
            },
            temperature: Some(48.3),
            network: NetworkStats::default(),
            wifi: WifiInfo {
                ssid: "Lobby".to_string(),
                signal_strength: "-50 dBm".to_string(),
            },
            version: "0.1.0".to_string(),
        })
    }
}

// =============================== DOCUMENTS ====================================== //

pub fn media(id: &str, url: &str, content_type: &str) -> Value {
    json!({ "id": id, "url": url, "type": content_type })
}

pub fn group_doc(media: Vec<Value>) -> Value {
    json!({ "name": "Lobby screens", "media": media })
}

pub fn device_doc(group_id: Option<&str>) -> Value {
    match group_id {
        Some(group_id) => json!({ "name": "Lobby", "groupId": group_id, "status": "offline" }),
        None => json!({ "name": "Lobby", "status": "offline" }),
    }
}

pub fn device_ref() -> DocRef {
    DocRef::device(DEVICE_KEY)
}

/// Field updates written to the device record, oldest first
pub fn device_updates(store: &MemoryStore) -> Vec<Value> {
    store
        .updates()
        .into_iter()
        .filter(|(doc, _)| *doc == device_ref())
        .map(|(_, fields)| fields)
        .collect()
}

/// Field updates written after the first `skip` ones
pub fn device_updates_since(store: &MemoryStore, skip: usize) -> Vec<Value> {
    device_updates(store).into_iter().skip(skip).collect()
}

pub fn watcher_options() -> watcher::Options {
    watcher::Options {
        device_key: DEVICE_KEY.to_string(),
        settle_delay: Duration::from_millis(10),
        device_ip: Some("10.0.0.5".to_string()),
    }
}

/// Receive events until one matches, failing after five seconds
pub async fn next_matching<F>(events: &mut broadcast::Receiver<WatchEvent>, matches: F) -> WatchEvent
where
    F: Fn(&WatchEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("watcher event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching watcher event")
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

// ================================ FIXTURE ======================================= //

/// An opened watcher and a coordinator wired to in-memory collaborators
pub struct Fixture {
    pub temp: TempDir,
    pub layout: StorageLayout,
    pub store: Arc<MemoryStore>,
    pub watcher: RemoteStateWatcher,
    pub cache: Arc<MediaCache>,
    pub fetcher: Arc<FakeFetcher>,
    pub refresher: Arc<FakeRefresher>,
    pub rebooter: Arc<FakeRebooter>,
    pub coordinator: Arc<SyncCoordinator>,
    /// Device updates written while opening
    pub opened_updates: usize,
}

impl Fixture {
    pub async fn new(group_id: Option<&str>, groups: Vec<(&str, Value)>) -> Self {
        Self::with_fetcher(FakeFetcher::new(), group_id, groups).await
    }

    pub async fn with_fetcher(
        fetcher: FakeFetcher,
        group_id: Option<&str>,
        groups: Vec<(&str, Value)>,
    ) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(temp.path());

        let store = Arc::new(MemoryStore::new());
        store.put(&device_ref(), device_doc(group_id));
        for (id, document) in groups {
            store.put(&DocRef::group(id), document);
        }

        let watcher = RemoteStateWatcher::new(store.clone(), watcher_options());
        watcher.open().await.unwrap();

        let fetcher = Arc::new(fetcher);
        let refresher = Arc::new(FakeRefresher::default());
        let rebooter = Arc::new(FakeRebooter::default());
        let cache = Arc::new(MediaCache::new(&layout, fetcher.clone()));

        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            device_ref(),
            watcher.state(),
            cache.clone(),
            refresher.clone(),
            rebooter.clone(),
            coordinator::Options::default(),
        ));

        let opened_updates = device_updates(&store).len();
        Self {
            temp,
            layout,
            store,
            watcher,
            cache,
            fetcher,
            refresher,
            rebooter,
            coordinator,
            opened_updates,
        }
    }

    /// Device updates written since the fixture was opened
    pub fn updates(&self) -> Vec<Value> {
        device_updates_since(&self.store, self.opened_updates)
    }

    pub fn media_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.layout.media_dir().path())
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}
