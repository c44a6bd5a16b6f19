//! On-disk media cache
//!
//! The cache directory is flat and carries no metadata: a media asset is
//! cached exactly when a file named after it exists. Reconciling against a
//! group downloads what is missing and evicts what is no longer referenced.
//! A failed download leaves the file absent, so the next reconcile retries it.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::fetch::BlobFetcher;
use crate::cache::naming::{derive_filename, is_safe_filename};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::group::{GroupRecord, MediaAsset};
use crate::storage::layout::StorageLayout;

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Files fetched during this pass
    pub downloaded: Vec<String>,

    /// Unreferenced files removed
    pub evicted: Vec<String>,

    /// Needed files whose download failed
    pub failed: Vec<String>,

    /// Unreferenced files that could not be removed
    pub evict_failed: Vec<String>,

    /// Needed files already present
    pub kept: usize,
}

impl ReconcileReport {
    /// Whether the pass touched the cache directory at all
    pub fn changed(&self) -> bool {
        !self.downloaded.is_empty() || !self.evicted.is_empty()
    }

    /// Whether the directory now matches the group exactly
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty() && self.evict_failed.is_empty()
    }
}

/// Local media files plus the last group snapshot they were reconciled for
pub struct MediaCache {
    media_dir: Dir,
    staging_dir: Dir,
    snapshot_file: File,
    fetcher: Arc<dyn BlobFetcher>,
    current_group: RwLock<Option<GroupRecord>>,
}

impl MediaCache {
    /// Create a cache rooted in the storage layout
    pub fn new(layout: &StorageLayout, fetcher: Arc<dyn BlobFetcher>) -> Self {
        Self {
            media_dir: layout.media_dir(),
            staging_dir: layout.staging_dir(),
            snapshot_file: layout.cached_group_file(),
            fetcher,
            current_group: RwLock::new(None),
        }
    }

    /// Directory holding the cached files
    pub fn media_dir(&self) -> &Dir {
        &self.media_dir
    }

    /// Restore the group snapshot persisted by a previous run
    pub async fn load(&self) {
        if !self.snapshot_file.exists().await {
            return;
        }
        match self.snapshot_file.read_json::<GroupRecord>().await {
            Ok(group) => {
                info!("Restored cached group {} ({} media)", group.id, group.media.len());
                *self.current_group.write().unwrap_or_else(|e| e.into_inner()) = Some(group);
            }
            Err(e) => warn!("Ignoring unreadable cached group: {}", e),
        }
    }

    /// Group the display is currently supposed to show
    pub fn cached_group(&self) -> Option<GroupRecord> {
        self.current_group
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the snapshot slot; persisting it is best effort
    pub async fn set_cached_group(&self, group: GroupRecord) {
        if let Err(e) = self.snapshot_file.write_json(&group).await {
            warn!("Failed to persist cached group {}: {}", group.id, e);
        }
        *self.current_group.write().unwrap_or_else(|e| e.into_inner()) = Some(group);
    }

    /// Bring the cache directory in line with `group.media`.
    ///
    /// Only failing to prepare or list the cache directory is an error;
    /// download and eviction failures are reported and left for the next pass.
    pub async fn reconcile(&self, group: &GroupRecord) -> Result<ReconcileReport, AgentError> {
        self.media_dir.create().await?;
        self.staging_dir.create().await?;

        let existing = self.media_dir.file_names().await?;
        let mut needed: HashSet<String> = HashSet::new();
        let mut report = ReconcileReport::default();

        info!(
            "Reconciling {} media for group {} against {} cached files",
            group.media.len(),
            group.id,
            existing.len()
        );

        for asset in &group.media {
            let filename = derive_filename(asset);
            if !is_safe_filename(&filename) {
                warn!("Skipping media with unusable id {:?}", asset.id);
                continue;
            }
            if !needed.insert(filename.clone()) {
                continue;
            }
            if existing.contains(&filename) {
                report.kept += 1;
                continue;
            }

            match self.download(asset, &filename).await {
                Ok(bytes) => {
                    info!("Downloaded {} ({} bytes)", filename, bytes);
                    report.downloaded.push(filename);
                }
                Err(e) => {
                    error!("Error downloading {} from {}: {}", asset.id, asset.url, e);
                    report.failed.push(filename);
                }
            }
        }

        let mut stale: Vec<&String> = existing.difference(&needed).collect();
        stale.sort();
        for filename in stale {
            match self.media_dir.file(filename).delete().await {
                Ok(()) => {
                    info!("Removed unused file: {}", filename);
                    report.evicted.push(filename.clone());
                }
                Err(e) => {
                    error!("Error removing {}: {}", filename, e);
                    report.evict_failed.push(filename.clone());
                }
            }
        }

        debug!("Reconcile report: {:?}", report);
        Ok(report)
    }

    /// Fetch into the staging directory, then rename into place so a partial
    /// download never shows up under its final name
    async fn download(&self, asset: &MediaAsset, filename: &str) -> Result<u64, AgentError> {
        let staged = self
            .staging_dir
            .path()
            .join(format!("{}.{}.part", filename, Uuid::new_v4()));

        let result = async {
            let bytes = self.fetcher.fetch(&asset.url, &staged).await?;
            fs::rename(&staged, self.media_dir.path().join(filename)).await?;
            Ok(bytes)
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&staged).await;
        }
        result
    }
}
