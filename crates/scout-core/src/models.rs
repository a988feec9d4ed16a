//! Shared records exchanged between the scanner, the registry, the hub
//! search, and the download manager.
//!
//! Records are constructed through fallible constructors that reject entries
//! with no name or no category, so malformed references fail at the boundary
//! instead of downstream.

use crate::error::{Result, ScoutError};
use serde::{Deserialize, Serialize};

/// Normalize a path-ish asset name to forward slashes.
pub fn normalize_path(name: &str) -> String {
    name.replace('\\', "/")
}

/// Final path component of an asset name, after normalization.
pub fn file_basename(name: &str) -> String {
    let normalized = normalize_path(name);
    normalized
        .rsplit('/')
        .next()
        .unwrap_or(&normalized)
        .to_string()
}

/// Where in a node a correction (or missing reference) was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum CorrectionSite {
    /// Positional widget value at this index.
    Widget(usize),
    /// Entry of the node's structured model descriptor list.
    Property(usize),
    /// Workflow-level metadata; no node exists to correct.
    Metadata,
}

/// Origin of a resolved download URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSource {
    /// Declared directly in the workflow (node properties or metadata map).
    Embedded,
    /// Extracted from a free-text note node.
    Note,
    /// Found via the remote hub search.
    RemoteSearch,
    /// No URL resolved.
    None,
}

/// One place in the workflow where an asset is referenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRef {
    pub name: String,
    pub category: String,
    pub node_id: Option<i64>,
    pub node_type: Option<String>,
    pub site: Option<CorrectionSite>,
}

/// A model reference that may need downloading or manual selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingModel {
    pub name: String,
    pub category: String,
    pub node_id: Option<i64>,
    pub node_type: Option<String>,
    pub site: Option<CorrectionSite>,
    pub url: Option<String>,
    pub url_source: UrlSource,
    pub expected_filename: Option<String>,
    /// Differs from `expected_filename` when the remote source stores the
    /// file under another name; the download renames on save.
    pub actual_filename: Option<String>,
    /// The URL that failed validation, when a re-search replaced it.
    pub original_url: Option<String>,
    pub needs_category_selection: bool,
    pub related_usages: Vec<UsageRef>,
    /// Structured reason when the model ended up unresolvable.
    pub not_found_reason: Option<String>,
}

impl MissingModel {
    /// Create a missing-model record. Name and category must be non-empty.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let category = category.into();
        if name.trim().is_empty() {
            return Err(ScoutError::Validation {
                field: "name".into(),
                message: "missing model requires a name".into(),
            });
        }
        if category.trim().is_empty() {
            return Err(ScoutError::Validation {
                field: "category".into(),
                message: "missing model requires a category".into(),
            });
        }
        Ok(Self {
            name,
            category,
            node_id: None,
            node_type: None,
            site: None,
            url: None,
            url_source: UrlSource::None,
            expected_filename: None,
            actual_filename: None,
            original_url: None,
            needs_category_selection: false,
            related_usages: Vec::new(),
            not_found_reason: None,
        })
    }

    /// Uniqueness key: normalized lowercase `(name, category)`.
    pub fn dedup_key(&self) -> (String, String) {
        (
            normalize_path(&self.name).to_lowercase(),
            normalize_path(&self.category).to_lowercase(),
        )
    }

    /// The usage metadata this entry contributes when merged into another.
    pub fn usage(&self) -> UsageRef {
        UsageRef {
            name: self.name.clone(),
            category: self.category.clone(),
            node_id: self.node_id,
            node_type: self.node_type.clone(),
            site: self.site,
        }
    }
}

/// An in-place fix for a stale asset path found to exist elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub name: String,
    pub old_path: String,
    pub new_path: String,
    pub category: String,
    pub node_id: Option<i64>,
    pub node_type: Option<String>,
    pub site: CorrectionSite,
}

impl Correction {
    /// Uniqueness key: the exact graph position being corrected.
    pub fn dedup_key(&self) -> (Option<i64>, CorrectionSite) {
        (self.node_id, self.site)
    }
}

/// Input to the download manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub expected_filename: String,
    /// Remote-side filename; requires a rename-on-save when it differs.
    pub actual_filename: Option<String>,
    pub download_url: String,
    pub category: String,
}

impl DownloadJob {
    pub fn new(
        expected_filename: impl Into<String>,
        download_url: impl Into<String>,
        category: impl Into<String>,
    ) -> Result<Self> {
        let expected_filename = expected_filename.into();
        let download_url = download_url.into();
        let category = category.into();
        for (field, value) in [
            ("expected_filename", &expected_filename),
            ("download_url", &download_url),
            ("category", &category),
        ] {
            if value.trim().is_empty() {
                return Err(ScoutError::Validation {
                    field: field.into(),
                    message: format!("download job requires a non-empty {}", field),
                });
            }
        }
        Ok(Self {
            expected_filename,
            actual_filename: None,
            download_url,
            category,
        })
    }

    pub fn with_actual_filename(mut self, actual: impl Into<String>) -> Self {
        self.actual_filename = Some(actual.into());
        self
    }
}

/// Download task state machine. `Downloading` reaches exactly one terminal
/// state: `Completed`, `Cancelled`, or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Downloading,
    Completed,
    Cancelled,
    Error,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadState::Downloading)
    }
}

/// Tracks the state of one download task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub state: DownloadState,
    /// Percentage complete (0-100).
    pub progress: f64,
    pub downloaded: u64,
    pub total: u64,
    pub error: Option<String>,
}

impl DownloadStatus {
    pub fn started() -> Self {
        Self {
            state: DownloadState::Downloading,
            progress: 0.0,
            downloaded: 0,
            total: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Scanning,
    Complete,
}

/// Ordered scan stages. Validation only runs when there is something to
/// validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    Nodes,
    Metadata,
    Resolving,
    Validating,
    Complete,
}

/// Progress of the single tracked workflow scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub stage: ScanStage,
    /// Percentage (0-100).
    pub progress: u8,
    pub message: String,
}

impl ScanStatus {
    pub fn starting() -> Self {
        Self {
            state: ScanState::Scanning,
            stage: ScanStage::Nodes,
            progress: 0,
            message: "Scanning workflow nodes...".into(),
        }
    }
}

/// Final result of a workflow scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub missing_models: Vec<MissingModel>,
    pub not_found_models: Vec<MissingModel>,
    pub corrected_models: Vec<Correction>,
}

/// One repository's cached file listing, keyed by repository id in the
/// persisted cache map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoCacheEntry {
    pub last_modified: String,
    pub files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_and_basename() {
        assert_eq!(normalize_path("a\\b\\c.pt"), "a/b/c.pt");
        assert_eq!(file_basename("sub/dir/model.safetensors"), "model.safetensors");
        assert_eq!(file_basename("model.safetensors"), "model.safetensors");
        assert_eq!(file_basename("sub\\model.ckpt"), "model.ckpt");
    }

    #[test]
    fn test_missing_model_requires_name_and_category() {
        assert!(MissingModel::new("", "checkpoints").is_err());
        assert!(MissingModel::new("model.safetensors", " ").is_err());
        assert!(MissingModel::new("model.safetensors", "checkpoints").is_ok());
    }

    #[test]
    fn test_dedup_key_normalizes() {
        let a = MissingModel::new("Sub\\Model.safetensors", "Loras").unwrap();
        let b = MissingModel::new("sub/model.safetensors", "loras").unwrap();
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_download_job_validation() {
        assert!(DownloadJob::new("m.safetensors", "", "loras").is_err());
        assert!(DownloadJob::new("", "https://x/y", "loras").is_err());
        let job = DownloadJob::new("m.safetensors", "https://x/y", "loras")
            .unwrap()
            .with_actual_filename("other.safetensors");
        assert_eq!(job.actual_filename.as_deref(), Some("other.safetensors"));
    }

    #[test]
    fn test_correction_site_serialization() {
        let site = CorrectionSite::Widget(3);
        let json = serde_json::to_value(site).unwrap();
        assert_eq!(json["kind"], "widget");
        assert_eq!(json["index"], 3);

        let meta = serde_json::to_value(CorrectionSite::Metadata).unwrap();
        assert_eq!(meta["kind"], "metadata");
    }

    #[test]
    fn test_download_state_terminal() {
        assert!(!DownloadState::Downloading.is_terminal());
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(DownloadState::Error.is_terminal());
    }
}
