//! Display agent - Entry Point
//!
//! Runs on a signage terminal: follows its device record on the control
//! plane, keeps the local media cache in line with the assigned group and
//! reports heartbeats.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::time::Duration;

use signagent::app::options::{AppOptions, ServerOptions, StoreOptions};
use signagent::app::run::run;
use signagent::browser::refresh;
use signagent::diagnostic::run_diagnostic;
use signagent::logs::{init_logging, LogOptions};
use signagent::storage::layout::StorageLayout;
use signagent::storage::settings::{Settings, DEVICE_KEY_ENV};
use signagent::store::mqtt::MqttAddress;
use signagent::sync::coordinator;
use signagent::utils::{version_info, RetryOptions};
use signagent::watcher;
use signagent::workers::heartbeat;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to serialize version: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(base_dir) => StorageLayout::new(base_dir),
        None => StorageLayout::default(),
    };

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        return match run_diagnostic(&layout).await {
            true => ExitCode::SUCCESS,
            false => ExitCode::FAILURE,
        };
    }

    // Retrieve the settings file
    let settings_file = layout.settings_file();
    let (mut settings, settings_error) = match settings_file.read_json::<Settings>().await {
        Ok(settings) => (settings, None),
        Err(e) => (Settings::default(), Some(e)),
    };
    settings.apply_env();

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    if let Some(e) = settings_error {
        warn!(
            "Unable to read settings file {}, using defaults: {}",
            settings_file.path().display(),
            e
        );
    }

    if settings.device_key.is_empty() {
        error!(
            "No device key configured: set device_key in {} or {}",
            settings_file.path().display(),
            DEVICE_KEY_ENV
        );
        return ExitCode::FAILURE;
    }

    let options = build_options(version.version, layout, settings);

    info!("Running display agent with options: {:?}", options);
    match run(options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run the agent: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_options(agent_version: String, layout: StorageLayout, settings: Settings) -> AppOptions {
    AppOptions {
        agent_version,
        layout,
        store: StoreOptions {
            base_url: settings.store.base_url,
            api_key: settings.store.api_key,
            poll_interval: Duration::from_secs(settings.store.poll_interval_secs),
            mqtt_broker: MqttAddress {
                host: settings.mqtt_broker.host,
                port: settings.mqtt_broker.port,
                use_tls: settings.mqtt_broker.tls,
                ca_cert_path: settings.mqtt_broker.ca_cert_path,
            },
        },
        watcher: watcher::Options {
            device_key: settings.device_key,
            settle_delay: Duration::from_millis(settings.sync.group_settle_delay_ms),
            device_ip: settings.device_ip,
        },
        coordinator: coordinator::Options {
            min_sync_interval: Duration::from_secs(settings.sync.min_sync_interval_secs),
        },
        heartbeat: heartbeat::Options {
            interval: Duration::from_secs(settings.heartbeat_interval_secs),
        },
        browser: refresh::Options {
            debugger_url: settings.browser.debugger_url,
            page_url_match: settings.browser.page_url_match,
            retry: RetryOptions {
                max_attempts: settings.browser.max_attempts,
                delay: Duration::from_secs(settings.browser.retry_delay_secs),
            },
            response_timeout: Duration::from_secs(settings.browser.response_timeout_secs),
        },
        reboot_command: settings.reboot_command,
        enable_server: settings.server.enabled,
        server: ServerOptions {
            host: settings.server.host,
            port: settings.server.port,
        },
        ..Default::default()
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
