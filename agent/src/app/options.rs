//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::browser::refresh;
use crate::storage::layout::StorageLayout;
use crate::store::mqtt::MqttAddress;
use crate::sync::coordinator;
use crate::watcher;
use crate::workers::heartbeat;

/// Main application options
#[derive(Debug)]
pub struct AppOptions {
    /// Agent version reported in diagnostics
    pub agent_version: String,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Remote document store
    pub store: StoreOptions,

    /// Device and group watching
    pub watcher: watcher::Options,

    /// Sync rate limiting
    pub coordinator: coordinator::Options,

    /// Heartbeat worker options
    pub heartbeat: heartbeat::Options,

    /// Display page reloads
    pub browser: refresh::Options,

    /// Command used to reboot the device
    pub reboot_command: Vec<String>,

    /// Enable the local display API
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            store: StoreOptions::default(),
            watcher: watcher::Options::default(),
            coordinator: coordinator::Options::default(),
            heartbeat: heartbeat::Options::default(),
            browser: refresh::Options::default(),
            reboot_command: vec!["sudo".to_string(), "reboot".to_string()],
            enable_server: true,
            server: ServerOptions::default(),
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Attempts at reading the device record before giving up
    pub max_open_attempts: u32,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_open_attempts: 10,
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Remote document store options
#[derive(Debug)]
pub struct StoreOptions {
    /// Base URL of the document REST API
    pub base_url: String,

    /// Bearer credential, also used as the MQTT password
    pub api_key: Option<SecretString>,

    /// Subscription poll interval without a broker
    pub poll_interval: Duration,

    /// Broker for push subscriptions, unused when the host is empty
    pub mqtt_broker: MqttAddress,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            api_key: None,
            poll_interval: Duration::from_secs(10),
            mqtt_broker: MqttAddress::default(),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}
