//! Self checks run with `--diag`

use colored::Colorize;
use secrecy::{ExposeSecret, SecretString};

use crate::browser::refresh::{self, BrowserRefreshClient};
use crate::errors::AgentError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::store::rest::RestStore;
use crate::store::DocRef;
use crate::telemetry::{MetricsProvider, SysinfoMetrics};
use crate::utils::{version_info, RetryOptions};

enum Check {
    Pass(String),
    Warn(String),
    Fail(String),
}

fn report(label: &str, check: &Check) {
    match check {
        Check::Pass(detail) => println!("[{}] {}: {}", " OK ".green().bold(), label, detail),
        Check::Warn(detail) => println!("[{}] {}: {}", "WARN".yellow().bold(), label, detail),
        Check::Fail(detail) => println!("[{}] {}: {}", "FAIL".red().bold(), label, detail),
    }
}

/// Print one line per check; returns whether every check passed
pub async fn run_diagnostic(layout: &StorageLayout) -> bool {
    let version = version_info();
    println!(
        "{} {} ({}, built {})",
        "signagent".bold(),
        version.version,
        version.git_hash,
        version.build_time
    );

    let mut checks = Vec::new();

    let settings = match layout.settings_file().read_json::<Settings>().await {
        Ok(mut settings) => {
            settings.apply_env();
            checks.push((
                "settings",
                Check::Pass(layout.settings_file().path().display().to_string()),
            ));
            settings
        }
        Err(e) => {
            checks.push(("settings", Check::Warn(format!("using defaults ({e})"))));
            let mut settings = Settings::default();
            settings.apply_env();
            settings
        }
    };

    checks.push(("device key", check_device_key(&settings)));
    checks.push(("document store", check_store(&settings).await));
    checks.push(("display browser", check_browser(&settings).await));
    checks.push(("metrics", check_metrics(&version.version).await));
    checks.push(("media cache", check_media(layout).await));

    for (label, check) in &checks {
        report(label, check);
    }
    !checks.iter().any(|(_, check)| matches!(check, Check::Fail(_)))
}

fn check_device_key(settings: &Settings) -> Check {
    if settings.device_key.is_empty() {
        Check::Fail("not configured".to_string())
    } else {
        Check::Pass(settings.device_key.clone())
    }
}

async fn check_store(settings: &Settings) -> Check {
    if settings.device_key.is_empty() {
        return Check::Warn("skipped without a device key".to_string());
    }
    let api_key = settings
        .store
        .api_key
        .as_ref()
        .map(|key| SecretString::from(key.expose_secret().to_string()));

    let result: Result<_, AgentError> = async {
        let rest = RestStore::new(&settings.store.base_url, api_key)?;
        rest.get_document(&DocRef::device(&settings.device_key)).await
    }
    .await;

    match result {
        Ok(Some(_)) => Check::Pass(format!("device record found at {}", settings.store.base_url)),
        Ok(None) => Check::Fail(format!("device {} does not exist", settings.device_key)),
        Err(e) => Check::Fail(e.to_string()),
    }
}

async fn check_browser(settings: &Settings) -> Check {
    let options = refresh::Options {
        debugger_url: settings.browser.debugger_url.clone(),
        page_url_match: settings.browser.page_url_match.clone(),
        retry: RetryOptions::default(),
        response_timeout: std::time::Duration::from_secs(settings.browser.response_timeout_secs),
    };
    let client = match BrowserRefreshClient::new(options) {
        Ok(client) => client,
        Err(e) => return Check::Fail(e.to_string()),
    };

    match client.list_pages().await {
        Ok(pages) => match client.select_page(&pages) {
            Some(page) => Check::Pass(format!("display page {}", page.url)),
            None => Check::Warn(format!("{} pages open, none serving the display", pages.len())),
        },
        Err(e) => Check::Warn(format!("debugger unreachable ({e})")),
    }
}

async fn check_metrics(version: &str) -> Check {
    match SysinfoMetrics::new(version.to_string()).collect().await {
        Ok(diagnostics) => Check::Pass(format!(
            "memory {}%, disk {}%, wifi {}",
            diagnostics.memory.percent, diagnostics.disk.percent, diagnostics.wifi.ssid
        )),
        Err(e) => Check::Fail(e.to_string()),
    }
}

async fn check_media(layout: &StorageLayout) -> Check {
    let media_dir = layout.media_dir();
    if !media_dir.exists().await {
        return Check::Warn(format!("{} not created yet", media_dir.path().display()));
    }
    match media_dir.file_names().await {
        Ok(names) => Check::Pass(format!("{} cached files", names.len())),
        Err(e) => Check::Fail(e.to_string()),
    }
}
