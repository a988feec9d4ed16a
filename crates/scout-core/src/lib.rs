//! Scout - Headless library for missing-model resolution in node-graph
//! workflows.
//!
//! This crate scans a workflow document for model references, auto-corrects
//! references to models installed under a different subpath, resolves
//! download URLs for the rest (embedded data, note links, remote hub search),
//! and downloads files with progress tracking, cancellation, and atomic
//! placement. It can be used programmatically without any HTTP layer; the
//! `scout-rpc` crate wraps it in one.
//!
//! # Example
//!
//! ```rust,ignore
//! use scout_library::ScoutService;
//!
//! #[tokio::main]
//! async fn main() -> scout_library::Result<()> {
//!     let service = ScoutService::new("/path/to/models", "/path/to/data")?;
//!
//!     let mut workflow = serde_json::from_str(&workflow_json)?;
//!     let result = service.scan(&mut workflow).await;
//!     println!("{} models missing", result.missing_models.len());
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod hub;
pub mod models;
pub mod persist;
pub mod registry;
pub mod scanner;
pub mod workflow;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use download::DownloadManager;
pub use error::{Result, ScoutError};
pub use hub::{HubMatch, HubSearch, MatchKind, SearchResults};
pub use models::{
    Correction, CorrectionSite, DownloadJob, DownloadState, DownloadStatus, MissingModel,
    ScanResult, ScanStage, ScanState, ScanStatus, UrlSource, UsageRef,
};
pub use registry::{FolderRegistry, FsModelStore, ModelStore};
pub use scanner::WorkflowScanner;
pub use workflow::Workflow;

use crate::config::{PathsConfig, ScanConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Long-lived owner of every shared table and client in the library.
///
/// Construct one per process and share it behind an [`Arc`]. All mutable
/// state (download progress, scan progress, the repo cache) lives in fields
/// of this object rather than in process-wide statics.
pub struct ScoutService {
    registry: Arc<FolderRegistry>,
    hub: Arc<HubSearch>,
    downloads: DownloadManager,
    scanner: WorkflowScanner,
    scan_progress: Arc<RwLock<HashMap<String, ScanStatus>>>,
}

impl ScoutService {
    /// Build a service over a models root (categories are its first-level
    /// subdirectories) and a data directory for the persisted repo cache.
    pub fn new(models_root: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Result<Self> {
        let models_root = models_root.as_ref().to_path_buf();
        let store = Arc::new(FsModelStore::new(&models_root));
        let fallback_root = models_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| models_root.clone());
        Self::with_store(store, fallback_root, data_dir.as_ref())
    }

    /// Build a service over an arbitrary [`ModelStore`] implementation.
    pub fn with_store(
        store: Arc<dyn ModelStore>,
        fallback_root: impl Into<PathBuf>,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let registry = Arc::new(FolderRegistry::new(store, fallback_root));
        let cache_file = data_dir.as_ref().join(PathsConfig::REPO_CACHE_FILENAME);
        let hub = Arc::new(HubSearch::new(cache_file)?);
        Self::assemble(registry, hub)
    }

    /// Build a service around a pre-configured hub client, for tests that
    /// point the search at a stub server.
    pub fn with_hub(
        store: Arc<dyn ModelStore>,
        fallback_root: impl Into<PathBuf>,
        hub: HubSearch,
    ) -> Result<Self> {
        let registry = Arc::new(FolderRegistry::new(store, fallback_root));
        Self::assemble(registry, Arc::new(hub))
    }

    fn assemble(registry: Arc<FolderRegistry>, hub: Arc<HubSearch>) -> Result<Self> {
        let scan_progress = Arc::new(RwLock::new(HashMap::new()));
        let downloads = DownloadManager::new(registry.clone())?;
        let scanner = WorkflowScanner::new(registry.clone(), hub.clone(), scan_progress.clone())?;
        Ok(Self {
            registry,
            hub,
            downloads,
            scanner,
            scan_progress,
        })
    }

    /// Disable the URL validation stage of scans.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.scanner = self.scanner.with_validation(validate);
        self
    }

    pub fn registry(&self) -> &FolderRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &HubSearch {
        &self.hub
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Scan a workflow, correcting stale references in place.
    pub async fn scan(&self, workflow: &mut Workflow) -> ScanResult {
        self.scanner.find_missing_models(workflow).await
    }

    /// Progress of the currently tracked scan, if any has run.
    pub async fn scan_progress(&self) -> Option<ScanStatus> {
        self.scan_progress
            .read()
            .await
            .get(ScanConfig::CURRENT_SCAN_ID)
            .cloned()
    }

    /// Search the remote hub for a filename.
    pub async fn search(&self, filename: &str) -> SearchResults {
        self.hub.search_filename(filename).await
    }

    /// Sorted category keys the host has registered.
    pub fn categories(&self) -> Vec<String> {
        self.registry.available_categories()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_service_scan_and_categories() {
        let temp = TempDir::new().unwrap();
        let models = temp.path().join("models");
        std::fs::create_dir_all(models.join("loras").join("characters")).unwrap();
        std::fs::write(
            models
                .join("loras")
                .join("characters")
                .join("lora_x.safetensors"),
            b"x",
        )
        .unwrap();

        let service = ScoutService::new(&models, temp.path())
            .unwrap()
            .with_validation(false);

        assert_eq!(service.categories(), vec!["loras".to_string()]);

        let mut workflow: Workflow = serde_json::from_value(serde_json::json!({
            "nodes": [{"id": 1, "type": "LoraLoader",
                       "widgets_values": ["lora_x.safetensors"]}]
        }))
        .unwrap();

        let result = service.scan(&mut workflow).await;
        assert_eq!(result.corrected_models.len(), 1);
        assert!(result.missing_models.is_empty());

        let status = service.scan_progress().await.unwrap();
        assert_eq!(status.progress, 100);
    }
}
