//! Device diagnostics collection

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::{Components, Disks, Networks, System};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::AgentError;

const NOT_CONNECTED: &str = "Not connected";
const NO_SIGNAL: &str = "No signal";
const PROBE_ERROR: &str = "Error";

/// Memory usage in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f32,
}

/// Usage of the root filesystem in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f32,
}

/// Traffic counters summed over all interfaces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

/// Wireless link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiInfo {
    pub ssid: String,
    pub signal_strength: String,
}

impl WifiInfo {
    fn disconnected() -> Self {
        Self {
            ssid: NOT_CONNECTED.to_string(),
            signal_strength: NO_SIGNAL.to_string(),
        }
    }

    fn probe_error() -> Self {
        Self {
            ssid: PROBE_ERROR.to_string(),
            signal_strength: PROBE_ERROR.to_string(),
        }
    }
}

/// Diagnostics attached to every heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// RFC 3339 collection time
    pub timestamp: String,

    /// Seconds since boot
    pub uptime: u64,

    pub memory: MemoryUsage,

    /// Global CPU usage percentage (0-100)
    pub cpu: f32,

    pub disk: DiskUsage,

    /// Hottest sensor in degrees Celsius, when sensors are readable
    pub temperature: Option<f32>,

    pub network: NetworkStats,

    pub wifi: WifiInfo,

    /// Agent version
    pub version: String,
}

/// Source of local diagnostics
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn collect(&self) -> Result<Diagnostics, AgentError>;
}

/// Diagnostics read through `sysinfo` and the wireless tools
pub struct SysinfoMetrics {
    system: Mutex<System>,
    version: String,
}

impl SysinfoMetrics {
    pub fn new(version: String) -> Self {
        let mut system = System::new();
        // cpu usage is a delta between two refreshes
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
            version,
        }
    }

    fn sample_system(&self) -> (MemoryUsage, f32) {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let available = system.available_memory();
        let memory = MemoryUsage {
            total,
            available,
            used: system.used_memory(),
            free: system.free_memory(),
            percent: percent(total.saturating_sub(available), total),
        };
        (memory, system.global_cpu_usage())
    }
}

#[async_trait]
impl MetricsProvider for SysinfoMetrics {
    async fn collect(&self) -> Result<Diagnostics, AgentError> {
        let (memory, cpu) = self.sample_system();
        let wifi = wifi_info().await;

        Ok(Diagnostics {
            timestamp: Utc::now().to_rfc3339(),
            uptime: System::uptime(),
            memory,
            cpu,
            disk: root_disk_usage(),
            temperature: cpu_temperature(),
            network: network_stats(),
            wifi,
            version: self.version.clone(),
        })
    }
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 1000.0).round() as f32 / 10.0
}

fn root_disk_usage() -> DiskUsage {
    let disks = Disks::new_with_refreshed_list();
    let Some(root) = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
    else {
        return DiskUsage::default();
    };

    let total = root.total_space();
    let free = root.available_space();
    let used = total.saturating_sub(free);
    DiskUsage {
        total,
        used,
        free,
        percent: percent(used, total),
    }
}

fn network_stats() -> NetworkStats {
    let networks = Networks::new_with_refreshed_list();
    networks
        .iter()
        .fold(NetworkStats::default(), |mut stats, (_, data)| {
            stats.bytes_sent += data.total_transmitted();
            stats.bytes_recv += data.total_received();
            stats.packets_sent += data.total_packets_transmitted();
            stats.packets_recv += data.total_packets_received();
            stats
        })
}

fn cpu_temperature() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    components
        .iter()
        .filter_map(|component| component.temperature())
        .filter(|t| t.is_finite())
        .reduce(f32::max)
}

async fn wifi_info() -> WifiInfo {
    let output = match Command::new("iwgetid").output().await {
        Ok(output) => output,
        Err(e) => {
            debug!("iwgetid unavailable: {}", e);
            return WifiInfo::probe_error();
        }
    };

    // iwgetid exits non-zero when no wireless link is up
    let Some(ssid) = parse_ssid(&String::from_utf8_lossy(&output.stdout)) else {
        return WifiInfo::disconnected();
    };

    let signal_strength = match Command::new("iwconfig").output().await {
        Ok(output) => parse_signal_level(&String::from_utf8_lossy(&output.stdout))
            .unwrap_or_else(|| "Unknown".to_string()),
        Err(e) => {
            warn!("Error getting WiFi signal level: {}", e);
            PROBE_ERROR.to_string()
        }
    };

    WifiInfo {
        ssid,
        signal_strength,
    }
}

/// SSID from `iwgetid` output such as `wlan0  ESSID:"office"`
pub fn parse_ssid(output: &str) -> Option<String> {
    let start = output.find("ESSID:\"")? + "ESSID:\"".len();
    let len = output[start..].find('"')?;
    let ssid = &output[start..start + len];
    if ssid.is_empty() {
        return None;
    }
    Some(ssid.to_string())
}

/// Signal level from `iwconfig` output, e.g. `-52 dBm`
pub fn parse_signal_level(output: &str) -> Option<String> {
    let start = output.find("Signal level=")? + "Signal level=".len();
    let len = output[start..].find(" dBm")? + " dBm".len();
    Some(output[start..start + len].trim().to_string())
}
