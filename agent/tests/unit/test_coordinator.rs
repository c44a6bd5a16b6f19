//! Sync coordinator integration tests

mod support;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use signagent::models::device::CommandFlags;
use signagent::sync::coordinator::{CommandOutcome, SyncPhase};

use support::{group_doc, media, FakeFetcher, Fixture};

const REBOOT: CommandFlags = CommandFlags {
    needs_sync: false,
    needs_reboot: true,
};

fn lobby_group() -> Value {
    group_doc(vec![
        media("a", "https://cdn.example.com/a.png", "image/png"),
        media("v", "https://cdn.example.com/v", "video/mp4"),
    ])
}

fn serve_lobby(fetcher: &FakeFetcher) {
    fetcher.serve("https://cdn.example.com/a.png", b"png");
    fetcher.serve("https://cdn.example.com/v", b"mp4");
}

async fn lobby_fixture() -> Fixture {
    let fetcher = FakeFetcher::new();
    serve_lobby(&fetcher);
    Fixture::with_fetcher(fetcher, Some("g1"), vec![("g1", lobby_group())]).await
}

fn statuses(updates: &[Value]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|fields| fields.get("status"))
        .map(|status| status.as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_sync_clears_flag_then_reconciles() {
    let fx = lobby_fixture().await;

    let outcome = fx
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now())
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Synced);
    assert_eq!(fx.media_files(), vec!["a.png", "v.mp4"]);

    let updates = fx.updates();
    assert_eq!(updates[0], json!({ "needsSync": false }));
    assert_eq!(statuses(&updates), vec!["syncing", "online"]);
    assert!(updates.last().unwrap().get("lastSync").is_some());

    assert_eq!(fx.refresher.calls(), 1);
    assert_eq!(fx.cache.cached_group().unwrap().id, "g1");
    assert_eq!(fx.coordinator.phase(), SyncPhase::Idle);

    let state = fx.coordinator.get_state();
    assert!(state.last_synced_at.is_some());
    assert_eq!(state.last_report.unwrap().downloaded.len(), 2);
}

#[tokio::test]
async fn test_failed_reconcile_sets_error_status() {
    let fx = lobby_fixture().await;
    std::fs::write(fx.layout.media_dir().path(), b"blocked").unwrap();

    let result = fx
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now())
        .await;

    assert!(result.is_err());
    let updates = fx.updates();
    assert_eq!(updates[0], json!({ "needsSync": false }));
    assert_eq!(statuses(&updates), vec!["syncing", "error"]);
    assert_eq!(fx.refresher.calls(), 0);
    assert_eq!(fx.coordinator.get_state().err_streak, 1);

    let device = fx.store.document(&support::device_ref()).unwrap();
    assert_eq!(device["needsSync"], false);
    assert_eq!(device["status"], "error");
}

#[tokio::test]
async fn test_syncs_closer_than_min_interval_are_dropped() {
    let fx = lobby_fixture().await;
    let start = Instant::now();

    let first = fx.coordinator.on_command(CommandFlags::sync(), start).await;
    let early = fx
        .coordinator
        .on_command(CommandFlags::sync(), start + Duration::from_millis(4900))
        .await;
    let later = fx
        .coordinator
        .on_command(CommandFlags::sync(), start + Duration::from_secs(5))
        .await;

    assert_eq!(first.unwrap(), CommandOutcome::Synced);
    assert_eq!(early.unwrap(), CommandOutcome::RateLimited);
    assert_eq!(later.unwrap(), CommandOutcome::Synced);
    assert_eq!(fx.refresher.calls(), 2);
}

#[tokio::test]
async fn test_failed_sync_does_not_start_rate_limit() {
    let fx = lobby_fixture().await;
    std::fs::write(fx.layout.media_dir().path(), b"blocked").unwrap();
    let start = Instant::now();

    assert!(fx.coordinator.on_command(CommandFlags::sync(), start).await.is_err());

    std::fs::remove_file(fx.layout.media_dir().path()).unwrap();
    let retry = fx
        .coordinator
        .on_command(CommandFlags::sync(), start + Duration::from_secs(1))
        .await;
    assert_eq!(retry.unwrap(), CommandOutcome::Synced);
}

#[tokio::test]
async fn test_only_one_sync_runs_at_a_time() {
    let (fetcher, gate) = FakeFetcher::gated();
    serve_lobby(&fetcher);
    let fx = Fixture::with_fetcher(fetcher, Some("g1"), vec![("g1", lobby_group())]).await;

    let coordinator = fx.coordinator.clone();
    let first = tokio::spawn(async move {
        coordinator
            .on_command(CommandFlags::sync(), Instant::now())
            .await
    });

    let fetcher = fx.fetcher.clone();
    support::eventually(|| !fetcher.calls().is_empty()).await;
    assert_eq!(fx.coordinator.phase(), SyncPhase::Syncing);

    let concurrent = fx
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now() + Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(concurrent, CommandOutcome::AlreadyRunning);

    gate.add_permits(10);
    assert_eq!(first.await.unwrap().unwrap(), CommandOutcome::Synced);
    assert_eq!(fx.refresher.calls(), 1);
    assert_eq!(fx.coordinator.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn test_wait_idle_returns_after_inflight_sync() {
    let (fetcher, gate) = FakeFetcher::gated();
    serve_lobby(&fetcher);
    let fx = Fixture::with_fetcher(fetcher, Some("g1"), vec![("g1", lobby_group())]).await;

    let coordinator = fx.coordinator.clone();
    let sync = tokio::spawn(async move {
        coordinator
            .on_command(CommandFlags::sync(), Instant::now())
            .await
    });
    let fetcher = fx.fetcher.clone();
    support::eventually(|| !fetcher.calls().is_empty()).await;

    let waiting = tokio::time::timeout(Duration::from_millis(50), fx.coordinator.wait_idle()).await;
    assert!(waiting.is_err());

    gate.add_permits(10);
    tokio::time::timeout(Duration::from_secs(5), fx.coordinator.wait_idle())
        .await
        .unwrap();
    sync.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_waits_for_inflight_sync_then_refuses_commands() {
    let (fetcher, gate) = FakeFetcher::gated();
    serve_lobby(&fetcher);
    let fx = Fixture::with_fetcher(fetcher, Some("g1"), vec![("g1", lobby_group())]).await;

    let coordinator = fx.coordinator.clone();
    let sync = tokio::spawn(async move {
        coordinator
            .on_command(CommandFlags::sync(), Instant::now())
            .await
    });
    let fetcher = fx.fetcher.clone();
    support::eventually(|| !fetcher.calls().is_empty()).await;

    let coordinator = fx.coordinator.clone();
    let closing = tokio::spawn(async move { coordinator.close().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished());

    gate.add_permits(10);
    closing.await.unwrap();
    assert_eq!(sync.await.unwrap().unwrap(), CommandOutcome::Synced);

    let written = fx.updates().len();
    let later = Instant::now() + Duration::from_secs(60);
    let outcome = fx
        .coordinator
        .on_command(CommandFlags::sync(), later)
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Closed);
    assert_eq!(fx.updates().len(), written);
}

#[tokio::test]
async fn test_closed_coordinator_ignores_reboot() {
    let fx = Fixture::new(None, vec![]).await;
    fx.coordinator.close().await;

    let outcome = fx.coordinator.on_command(REBOOT, Instant::now()).await.unwrap();

    assert_eq!(outcome, CommandOutcome::Closed);
    assert_eq!(fx.rebooter.calls(), 0);
    assert!(fx.updates().is_empty());
}

#[tokio::test]
async fn test_refresh_failure_keeps_sync_successful() {
    let fx = lobby_fixture().await;
    fx.refresher.set_fail(true);

    let outcome = fx
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now())
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Synced);
    assert_eq!(fx.refresher.calls(), 1);
    assert_eq!(statuses(&fx.updates()).last().unwrap(), "online");
}

#[tokio::test]
async fn test_sync_without_group_skips_reconcile_and_refresh() {
    let fx = Fixture::new(None, vec![]).await;

    let outcome = fx
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now())
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Synced);
    assert_eq!(statuses(&fx.updates()), vec!["syncing", "online"]);
    assert!(fx.fetcher.calls().is_empty());
    assert_eq!(fx.refresher.calls(), 0);
}

#[tokio::test]
async fn test_reboot_clears_flag_first_and_skips_sync() {
    let fx = lobby_fixture().await;

    let flags = CommandFlags {
        needs_sync: true,
        needs_reboot: true,
    };
    let outcome = fx.coordinator.on_command(flags, Instant::now()).await.unwrap();

    assert_eq!(outcome, CommandOutcome::Rebooted);
    assert_eq!(fx.rebooter.calls(), 1);
    assert!(fx.fetcher.calls().is_empty());
    assert_eq!(fx.coordinator.phase(), SyncPhase::Rebooting);

    let updates = fx.updates();
    assert_eq!(updates[0], json!({ "needsReboot": false }));
    assert_eq!(statuses(&updates), vec!["rebooting"]);
}

#[tokio::test]
async fn test_failed_reboot_reports_error() {
    let fx = lobby_fixture().await;
    fx.rebooter.set_fail(true);

    let result = fx.coordinator.on_command(REBOOT, Instant::now()).await;

    assert!(result.is_err());
    assert_eq!(statuses(&fx.updates()), vec!["rebooting", "error"]);
    assert_eq!(fx.coordinator.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn test_flag_clear_failure_abandons_command() {
    let fx = lobby_fixture().await;
    fx.store.set_fail_updates(true);

    let result = fx
        .coordinator
        .on_command(CommandFlags::sync(), Instant::now())
        .await;

    assert!(result.is_err());
    assert!(fx.fetcher.calls().is_empty());
    assert_eq!(fx.coordinator.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn test_no_flags_is_idle() {
    let fx = lobby_fixture().await;

    let outcome = fx
        .coordinator
        .on_command(CommandFlags::default(), Instant::now())
        .await
        .unwrap();

    assert_eq!(outcome, CommandOutcome::Idle);
    assert!(fx.updates().is_empty());
}
