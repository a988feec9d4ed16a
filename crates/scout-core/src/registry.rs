//! Category and path resolution over the host's installed-asset registry.
//!
//! The host side is abstracted behind [`ModelStore`]: a name→path lookup per
//! category. The registry only reads from it and writes downloaded files to
//! the paths it returns. [`FsModelStore`] is the filesystem-backed
//! implementation used in production.

use crate::config::{PathsConfig, ScanConfig};
use crate::models::{file_basename, normalize_path};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// Host boundary: per-category lookup of installed asset files.
pub trait ModelStore: Send + Sync {
    /// Relative paths (forward slashes) of installed files in a category.
    fn list_installed(&self, category_key: &str) -> Vec<String>;
    /// Keys of every registered category.
    fn registered_categories(&self) -> Vec<String>;
    /// Filesystem directories backing a category, in priority order.
    fn storage_paths(&self, category_key: &str) -> Vec<PathBuf>;
}

/// Exact node-type to category table, checked before the keyword scan.
const NODE_TYPE_TO_CATEGORY: &[(&str, &str)] = &[
    ("WanVideoModelLoader", "diffusion_models"),
    ("LoadWanVideoT5TextEncoder", "text_encoders"),
];

/// Keyword fallbacks for node-type classification. Order matters:
/// `clip_vision` must match before the bare `clip` keyword.
const NODE_TYPE_KEYWORDS: &[(&[&str], &str)] = &[
    (&["clip_vision", "clipvision"], "clip_vision"),
    (&["checkpoint"], "checkpoints"),
    (&["lora"], "loras"),
    (&["vae"], "vae"),
    (&["controlnet"], "controlnet"),
    (&["clip"], "text_encoders"),
    (&["unet", "diffusion"], "diffusion_models"),
    (&["upscale", "upscaler"], "upscale_models"),
    (&["embedding"], "embeddings"),
    (&["hypernetwork"], "hypernetworks"),
];

/// Candidate host keys per user-facing category name, tried in order.
fn category_key_candidates(category: &str) -> Vec<&str> {
    match category.to_lowercase().as_str() {
        "checkpoints" => vec!["checkpoints"],
        "loras" | "lora" => vec!["loras"],
        "vae" => vec!["vae"],
        "controlnet" => vec!["controlnet"],
        "clip" => vec!["text_encoders", "clip"],
        "clip_vision" => vec!["clip_vision"],
        "unet" => vec!["unet", "diffusion_models"],
        "diffusion_models" => vec!["diffusion_models", "unet"],
        "embeddings" => vec!["embeddings"],
        "hypernetworks" => vec!["hypernetworks"],
        "upscale_models" => vec!["upscale_models"],
        _ => vec![],
    }
}

/// Centralizes category lookups and path utilities.
pub struct FolderRegistry {
    store: Arc<dyn ModelStore>,
    /// Used for the conventional `models/<category>` destination when the
    /// host has no such category registered.
    fallback_root: PathBuf,
}

impl FolderRegistry {
    pub fn new(store: Arc<dyn ModelStore>, fallback_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            fallback_root: fallback_root.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> {
        &self.store
    }

    /// Resolve a user-facing category name to the actual host key.
    ///
    /// Tries the alias candidates in order and returns the first one the
    /// host recognizes; falls back to the first candidate, then the input.
    pub fn resolve_category_key(&self, category: &str) -> String {
        let registered = self.store.registered_categories();
        let candidates = category_key_candidates(category);

        for key in &candidates {
            if registered.iter().any(|r| r == key) {
                return (*key).to_string();
            }
        }
        candidates
            .first()
            .map(|k| (*k).to_string())
            .unwrap_or_else(|| category.to_string())
    }

    /// True iff the category's file list contains `name` at the exact
    /// normalized path, subdirectory included.
    pub fn is_installed(&self, name: &str, category: &str) -> bool {
        let key = self.resolve_category_key(category);
        if !self.store.registered_categories().iter().any(|r| *r == key) {
            return false;
        }
        let normalized = normalize_path(name);
        self.store
            .list_installed(&key)
            .iter()
            .any(|f| normalize_path(f) == normalized)
    }

    /// Find the actual relative path of an asset installed under a different
    /// subdirectory of the same category, matching by basename.
    pub fn find_actual_path(&self, name: &str, category: &str) -> Option<String> {
        let key = self.resolve_category_key(category);
        if !self.store.registered_categories().iter().any(|r| *r == key) {
            return None;
        }
        let wanted = file_basename(name);
        self.store
            .list_installed(&key)
            .into_iter()
            .find(|f| file_basename(f) == wanted)
    }

    /// Search every registered category for an asset, exact normalized path
    /// first, then basename. Returns `(relative_path, category)`.
    ///
    /// The search order starts from a conventional category list (extended
    /// with anything else the host registers) and is reordered by a cheap
    /// keyword heuristic on the lowercased name.
    pub fn find_in_all_categories(
        &self,
        name: &str,
        preferred: &[&str],
    ) -> Option<(String, String)> {
        let registered = self.store.registered_categories();

        let mut order: Vec<String> = if preferred.is_empty() {
            [
                "checkpoints",
                "loras",
                "vae",
                "controlnet",
                "clip",
                "unet",
                "diffusion_models",
                "embeddings",
                "hypernetworks",
                "upscale_models",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()
        } else {
            preferred.iter().map(|s| s.to_string()).collect()
        };
        for key in &registered {
            if !order.contains(key) {
                order.push(key.clone());
            }
        }
        let order = prioritize_by_name(order, &name.to_lowercase());

        let normalized = normalize_path(name);
        let wanted = file_basename(name);

        for category in order {
            let key = self.resolve_category_key(&category);
            if !registered.iter().any(|r| *r == key) {
                continue;
            }
            let files = self.store.list_installed(&key);

            if let Some(found) = files.iter().find(|f| normalize_path(f) == normalized) {
                return Some((found.clone(), category));
            }
            if let Some(found) = files.iter().find(|f| file_basename(f) == wanted) {
                return Some((found.clone(), category));
            }
        }
        None
    }

    /// Filesystem directory downloads for this category should land in.
    ///
    /// Prefers the storage path whose final segment equals the category name
    /// verbatim, to avoid legacy-alias directories; falls back to the first
    /// registered path, then to `<fallback_root>/models/<category>`.
    pub fn destination_path(&self, category: &str) -> PathBuf {
        let key = self.resolve_category_key(category);
        let paths = self.store.storage_paths(&key);
        if !paths.is_empty() {
            for path in &paths {
                if path.file_name().map(|n| n == category).unwrap_or(false) {
                    return path.clone();
                }
            }
            return paths[0].clone();
        }

        debug!("No registered storage for '{}', using fallback", category);
        self.fallback_root
            .join(PathsConfig::MODELS_DIR_NAME)
            .join(category)
    }

    /// Infer the category from a node type. `None` means the caller must ask
    /// the user to pick one.
    pub fn category_from_node_type(&self, node_type: &str) -> Option<&'static str> {
        let trimmed = node_type.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lowered = trimmed.to_lowercase();

        for (mapped, category) in NODE_TYPE_TO_CATEGORY {
            if mapped.trim().to_lowercase() == lowered {
                return Some(category);
            }
        }
        for (keywords, category) in NODE_TYPE_KEYWORDS {
            if keywords.iter().any(|k| lowered.contains(k)) {
                return Some(category);
            }
        }
        None
    }

    /// Sorted registered category keys.
    pub fn available_categories(&self) -> Vec<String> {
        let mut keys = self.store.registered_categories();
        keys.sort();
        keys
    }
}

/// Bump the category matching a name keyword to the front of the search
/// order. First matching keyword wins.
fn prioritize_by_name(order: Vec<String>, name_lower: &str) -> Vec<String> {
    const PRIORITY: &[(&[&str], &str)] = &[
        (&["lora"], "loras"),
        (&["vae"], "vae"),
        (&["checkpoint", "ckpt"], "checkpoints"),
        (&["controlnet"], "controlnet"),
        (&["clip", "text_encoder"], "clip"),
        (&["unet", "diffusion"], "unet"),
    ];

    for (keywords, target) in PRIORITY {
        if keywords.iter().any(|k| name_lower.contains(k))
            && order.iter().any(|c| c == target)
        {
            let mut reordered = vec![target.to_string()];
            reordered.extend(order.into_iter().filter(|c| c != target));
            return reordered;
        }
    }
    order
}

/// Filesystem-backed model store: each first-level subdirectory of the
/// models root is a category, and files beneath it (with a recognized asset
/// extension) are its installed entries.
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_asset_file(path: &Path) -> bool {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_lowercase(),
            None => return false,
        };
        ScanConfig::MODEL_FILE_EXTENSIONS
            .iter()
            .any(|ext| name.ends_with(ext))
    }
}

impl ModelStore for FsModelStore {
    fn list_installed(&self, category_key: &str) -> Vec<String> {
        let dir = self.root.join(category_key);
        if !dir.is_dir() {
            return Vec::new();
        }
        let mut files: Vec<String> = WalkDir::new(&dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| Self::is_asset_file(e.path()))
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&dir)
                    .ok()
                    .map(|rel| normalize_path(&rel.to_string_lossy()))
            })
            .collect();
        files.sort();
        files
    }

    fn registered_categories(&self) -> Vec<String> {
        let mut keys: Vec<String> = std::fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        keys.sort();
        keys
    }

    fn storage_paths(&self, category_key: &str) -> Vec<PathBuf> {
        let dir = self.root.join(category_key);
        if dir.is_dir() {
            vec![dir]
        } else {
            Vec::new()
        }
    }
}
