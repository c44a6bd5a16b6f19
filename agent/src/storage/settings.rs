//! Settings file management

use secrecy::SecretString;
use serde::Deserialize;

use crate::logs::LogLevel;

/// Environment variable overriding [`Settings::device_key`]
pub const DEVICE_KEY_ENV: &str = "SIGNAGENT_DEVICE_KEY";

/// Environment variable overriding [`StoreSettings::api_key`]
pub const STORE_API_KEY_ENV: &str = "SIGNAGENT_STORE_API_KEY";

/// Agent settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under the storage layout
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Key of this terminal's record in the `devices` collection
    #[serde(default)]
    pub device_key: String,

    /// Address announced to the control plane, discovered when absent
    #[serde(default)]
    pub device_ip: Option<String>,

    /// Remote document store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// MQTT broker used for push subscriptions
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// Sync behaviour
    #[serde(default)]
    pub sync: SyncSettings,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Display browser control
    #[serde(default)]
    pub browser: BrowserSettings,

    /// Local display API
    #[serde(default)]
    pub server: ServerSettings,

    /// Command spawned when the control plane asks for a reboot
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_reboot_command() -> Vec<String> {
    vec!["sudo".to_string(), "reboot".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            device_key: String::new(),
            device_ip: None,
            store: StoreSettings::default(),
            mqtt_broker: MqttBrokerSettings::default(),
            sync: SyncSettings::default(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            browser: BrowserSettings::default(),
            server: ServerSettings::default(),
            reboot_command: default_reboot_command(),
        }
    }
}

impl Settings {
    /// Apply environment overrides on top of the file contents
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(DEVICE_KEY_ENV) {
            if !key.trim().is_empty() {
                self.device_key = key.trim().to_string();
            }
        }
        if let Ok(api_key) = std::env::var(STORE_API_KEY_ENV) {
            if !api_key.is_empty() {
                self.store.api_key = Some(SecretString::from(api_key));
            }
        }
    }
}

/// Remote document store settings
#[derive(Debug, Deserialize)]
pub struct StoreSettings {
    /// Base URL of the document REST API
    #[serde(default = "default_store_url")]
    pub base_url: String,

    /// Bearer credential for the document API
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Poll interval used for subscriptions when no MQTT broker is configured
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_store_url() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            api_key: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host, push subscriptions are disabled when empty
    #[serde(default)]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

fn default_mqtt_port() -> u16 {
    8883
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
        }
    }
}

/// Sync settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Minimum seconds between two accepted sync commands
    #[serde(default = "default_min_sync_interval")]
    pub min_sync_interval_secs: u64,

    /// Pause before reading a newly assigned group, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub group_settle_delay_ms: u64,
}

fn default_min_sync_interval() -> u64 {
    5
}

fn default_settle_delay() -> u64 {
    1000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            min_sync_interval_secs: default_min_sync_interval(),
            group_settle_delay_ms: default_settle_delay(),
        }
    }
}

/// Browser remote-debugging settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSettings {
    /// Remote debugging endpoint of the kiosk browser
    #[serde(default = "default_debugger_url")]
    pub debugger_url: String,

    /// Substring identifying the display page among open tabs
    #[serde(default = "default_page_url_match")]
    pub page_url_match: String,

    /// Refresh attempts before giving up
    #[serde(default = "default_refresh_attempts")]
    pub max_attempts: u32,

    /// Seconds between refresh attempts
    #[serde(default = "default_refresh_delay")]
    pub retry_delay_secs: u64,

    /// Seconds to wait for the reload acknowledgement
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

fn default_debugger_url() -> String {
    "http://localhost:9222".to_string()
}

fn default_page_url_match() -> String {
    "localhost:5000".to_string()
}

fn default_refresh_attempts() -> u32 {
    5
}

fn default_refresh_delay() -> u64 {
    2
}

fn default_response_timeout() -> u64 {
    5
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            debugger_url: default_debugger_url(),
            page_url_match: default_page_url_match(),
            max_attempts: default_refresh_attempts(),
            retry_delay_secs: default_refresh_delay(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

/// Local display API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Serve the local display API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    5000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}
