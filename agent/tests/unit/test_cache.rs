//! Media cache integration tests

mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use serde_json::json;
use tokio::net::TcpListener;

use signagent::cache::fetch::{BlobFetcher, HttpFetcher};
use signagent::cache::media::MediaCache;
use signagent::cache::naming::derive_filename;
use signagent::errors::AgentError;
use signagent::models::group::{GroupRecord, MediaAsset};
use signagent::storage::layout::StorageLayout;

use support::{media, FakeFetcher};

fn group(id: &str, media: Vec<serde_json::Value>) -> GroupRecord {
    GroupRecord::from_document(id, json!({ "media": media })).unwrap()
}

fn setup() -> (tempfile::TempDir, StorageLayout, Arc<FakeFetcher>) {
    let temp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(temp.path());
    let fetcher = Arc::new(FakeFetcher::new());
    for (url, body) in [
        ("https://cdn.example.com/a.png", b"png".as_slice()),
        ("https://cdn.example.com/b", b"jpeg".as_slice()),
        ("https://cdn.example.com/c.webm", b"webm".as_slice()),
        ("https://cdn.example.com/d.gif?v=3", b"gif".as_slice()),
    ] {
        fetcher.serve(url, body);
    }
    (temp, layout, fetcher)
}

fn files(layout: &StorageLayout) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(layout.media_dir().path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_filename_derivation() {
    let asset = |url: &str, content_type: Option<&str>| MediaAsset {
        id: "m1".to_string(),
        url: url.to_string(),
        content_type: content_type.map(str::to_string),
        duration: None,
    };

    assert_eq!(derive_filename(&asset("https://x/clip", Some("video/webm"))), "m1.webm");
    assert_eq!(derive_filename(&asset("https://x/clip.avi", Some("video"))), "m1.mp4");
    assert_eq!(derive_filename(&asset("https://x/clip", Some("video/quicktime"))), "m1.mov");
    assert_eq!(derive_filename(&asset("https://x/photo", Some("image/jpeg"))), "m1.jpg");
    assert_eq!(derive_filename(&asset("https://x/photo", None)), "m1.jpg");
    assert_eq!(derive_filename(&asset("https://x/photo.jpe", Some("image/png"))), "m1.png");
    assert_eq!(derive_filename(&asset("https://x/p.PNG?w=300", Some("image/png"))), "m1.png");
    assert_eq!(derive_filename(&asset("https://x/photo", Some("image/x-unknown"))), "m1.jpg");
}

#[tokio::test]
async fn test_reconcile_downloads_missing_media() {
    let (_temp, layout, fetcher) = setup();
    let cache = MediaCache::new(&layout, fetcher.clone());
    let group = group(
        "g1",
        vec![
            media("a", "https://cdn.example.com/a.png", "image/png"),
            media("b", "https://cdn.example.com/b", "image/jpeg"),
            media("c", "https://cdn.example.com/c.webm", "video/webm"),
        ],
    );

    let report = cache.reconcile(&group).await.unwrap();

    assert_eq!(report.downloaded, vec!["a.png", "b.jpg", "c.webm"]);
    assert!(report.evicted.is_empty());
    assert!(report.is_converged());
    assert_eq!(files(&layout), vec!["a.png", "b.jpg", "c.webm"]);
    assert_eq!(
        std::fs::read(layout.media_dir().path().join("b.jpg")).unwrap(),
        b"jpeg"
    );
    // nothing is left behind in staging
    assert_eq!(std::fs::read_dir(layout.staging_dir().path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (_temp, layout, fetcher) = setup();
    let cache = MediaCache::new(&layout, fetcher.clone());
    let group = group(
        "g1",
        vec![
            media("a", "https://cdn.example.com/a.png", "image/png"),
            media("d", "https://cdn.example.com/d.gif?v=3", "image/gif"),
        ],
    );

    cache.reconcile(&group).await.unwrap();
    let calls = fetcher.calls().len();
    let second = cache.reconcile(&group).await.unwrap();

    assert!(!second.changed());
    assert_eq!(second.kept, 2);
    assert_eq!(fetcher.calls().len(), calls);
    assert_eq!(files(&layout), vec!["a.png", "d.gif"]);
}

#[tokio::test]
async fn test_reconcile_converges_over_group_changes() {
    let (_temp, layout, fetcher) = setup();
    let cache = MediaCache::new(&layout, fetcher.clone());
    let a = media("a", "https://cdn.example.com/a.png", "image/png");
    let b = media("b", "https://cdn.example.com/b", "image/jpeg");
    let c = media("c", "https://cdn.example.com/c.webm", "video/webm");

    let snapshots = vec![
        (group("g1", vec![a.clone(), b.clone()]), vec!["a.png", "b.jpg"]),
        (group("g1", vec![b.clone(), c.clone()]), vec!["b.jpg", "c.webm"]),
        (group("g2", vec![]), vec![]),
        (group("g3", vec![c.clone(), a.clone()]), vec!["a.png", "c.webm"]),
    ];

    for (group, expected) in snapshots {
        cache.reconcile(&group).await.unwrap();
        assert_eq!(files(&layout), expected, "after group {}", group.id);
    }
}

#[tokio::test]
async fn test_reconcile_evicts_unreferenced_files() {
    let (_temp, layout, fetcher) = setup();
    layout.media_dir().create().await.unwrap();
    std::fs::write(layout.media_dir().path().join("old.jpg"), b"stale").unwrap();
    std::fs::create_dir(layout.media_dir().path().join("nested")).unwrap();

    let cache = MediaCache::new(&layout, fetcher);
    let report = cache
        .reconcile(&group(
            "g1",
            vec![media("a", "https://cdn.example.com/a.png", "image/png")],
        ))
        .await
        .unwrap();

    assert_eq!(report.evicted, vec!["old.jpg"]);
    // directories are not cache entries
    assert_eq!(files(&layout), vec!["a.png", "nested"]);
}

#[tokio::test]
async fn test_failed_download_is_retried_next_pass() {
    let (_temp, layout, fetcher) = setup();
    let cache = MediaCache::new(&layout, fetcher.clone());
    let group = group(
        "g1",
        vec![
            media("a", "https://cdn.example.com/a.png", "image/png"),
            media("e", "https://cdn.example.com/e.png", "image/png"),
        ],
    );

    let first = cache.reconcile(&group).await.unwrap();
    assert_eq!(first.failed, vec!["e.png"]);
    assert_eq!(files(&layout), vec!["a.png"]);
    assert_eq!(std::fs::read_dir(layout.staging_dir().path()).unwrap().count(), 0);

    fetcher.serve("https://cdn.example.com/e.png", b"late");
    let second = cache.reconcile(&group).await.unwrap();

    assert_eq!(second.downloaded, vec!["e.png"]);
    assert!(second.is_converged());
    assert_eq!(files(&layout), vec!["a.png", "e.png"]);
}

#[tokio::test]
async fn test_duplicate_and_unsafe_ids_are_skipped() {
    let (_temp, layout, fetcher) = setup();
    let cache = MediaCache::new(&layout, fetcher.clone());
    let group = group(
        "g1",
        vec![
            media("a", "https://cdn.example.com/a.png", "image/png"),
            media("a", "https://cdn.example.com/a.png", "image/png"),
            media("../escape", "https://cdn.example.com/a.png", "image/png"),
        ],
    );

    let report = cache.reconcile(&group).await.unwrap();

    assert_eq!(report.downloaded, vec!["a.png"]);
    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(files(&layout), vec!["a.png"]);
}

#[tokio::test]
async fn test_unusable_media_dir_fails_reconcile() {
    let (_temp, layout, fetcher) = setup();
    std::fs::write(layout.media_dir().path(), b"not a directory").unwrap();

    let cache = MediaCache::new(&layout, fetcher);
    let result = cache
        .reconcile(&group(
            "g1",
            vec![media("a", "https://cdn.example.com/a.png", "image/png")],
        ))
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_cached_group_survives_restart() {
    let (_temp, layout, fetcher) = setup();
    let snapshot = group(
        "g7",
        vec![media("a", "https://cdn.example.com/a.png", "image/png")],
    );

    let cache = MediaCache::new(&layout, fetcher.clone());
    assert!(cache.cached_group().is_none());
    cache.set_cached_group(snapshot.clone()).await;
    assert_eq!(cache.cached_group(), Some(snapshot.clone()));

    let restarted = MediaCache::new(&layout, fetcher);
    restarted.load().await;
    assert_eq!(restarted.cached_group(), Some(snapshot));
    // the snapshot lives outside the media directory
    assert!(!layout.media_dir().path().join("current_group.json").exists());
}

async fn blob_server() -> String {
    let app = Router::new()
        .route("/media/a.png", get(|| async { vec![7u8; 4096] }))
        .route(
            "/media/missing.png",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_http_fetcher_streams_to_file() {
    let base = blob_server().await;
    let temp = tempfile::tempdir().unwrap();
    let dest = temp.path().join("a.png.part");

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let bytes = fetcher
        .fetch(&format!("{base}/media/a.png"), &dest)
        .await
        .unwrap();

    assert_eq!(bytes, 4096);
    assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4096]);
}

#[tokio::test]
async fn test_http_fetcher_rejects_error_status() {
    let base = blob_server().await;
    let temp = tempfile::tempdir().unwrap();

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let result = fetcher
        .fetch(&format!("{base}/media/missing.png"), &temp.path().join("x"))
        .await;

    assert!(matches!(result, Err(AgentError::DownloadError(_))));
}
