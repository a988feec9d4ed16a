//! Centralized configuration constants for the Scout library.

use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const URL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = "scout-library/1.0";

    /// Progress is recorded once this many bytes accumulate since the last
    /// update, keeping cadence independent of chunk size.
    pub const DOWNLOAD_PROGRESS_BYTES: u64 = 20 * 1024 * 1024;
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".tmp";
}

/// Remote hub search configuration.
pub struct SearchConfig;

impl SearchConfig {
    pub const HUB_API_BASE: &'static str = "https://huggingface.co/api";
    pub const HUB_RESOLVE_BASE: &'static str = "https://huggingface.co";

    /// Ordered source list. Entries containing `/` are single repositories;
    /// plain entries are owners whose repositories are enumerated on demand.
    pub const SOURCES: &'static [&'static str] =
        &["Kijai", "city96", "Comfy-Org", "comfyanonymous", "lightx2v"];

    pub const MIN_FUZZY_SCORE: f64 = 0.55;
    pub const MAX_FUZZY_RESULTS: usize = 10;
}

/// Workflow scanning configuration.
pub struct ScanConfig;

impl ScanConfig {
    /// Fixed identifier for the single tracked scan.
    pub const CURRENT_SCAN_ID: &'static str = "current";

    /// Minimum length for a widget value to be considered an asset reference.
    pub const MIN_REFERENCE_LEN: usize = 5;

    pub const MODEL_FILE_EXTENSIONS: &'static [&'static str] = &[
        ".safetensors",
        ".ckpt",
        ".pt",
        ".pth",
        ".bin",
        ".sft",
        ".gguf",
    ];
}

/// Shared directory and file name configuration.
pub struct PathsConfig;

impl PathsConfig {
    pub const REPO_CACHE_FILENAME: &'static str = "repo-cache.json";
    pub const MODELS_DIR_NAME: &'static str = "models";
}
