//! Workflow scanning and URL resolution.
//!
//! A scan walks the workflow in stages: node references, workflow metadata,
//! URL resolution (embedded data, then note links, then the remote hub), and
//! an optional validation probe over every resolved URL. Stale references to
//! assets installed under a different subpath are corrected in place.

use crate::config::{NetworkConfig, ScanConfig};
use crate::error::{Result, ScoutError};
use crate::hub::HubSearch;
use crate::models::{
    file_basename, normalize_path, Correction, CorrectionSite, MissingModel, ScanResult,
    ScanStage, ScanState, ScanStatus, UrlSource,
};
use crate::registry::FolderRegistry;
use crate::workflow::{Node, Workflow, WorkflowExtra};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A download URL extracted from a note node, with the filename it produces.
#[derive(Debug, Clone)]
struct NoteUrl {
    filename: Option<String>,
    download_url: String,
}

/// Encapsulates workflow analysis and remote resolution.
pub struct WorkflowScanner {
    registry: Arc<FolderRegistry>,
    hub: Arc<HubSearch>,
    probe_client: reqwest::Client,
    scan_progress: Arc<RwLock<HashMap<String, ScanStatus>>>,
    validate_urls: bool,
    markdown_link: Regex,
    bare_url: Regex,
    hf_file: Regex,
    civitai_direct: Regex,
}

impl WorkflowScanner {
    pub fn new(
        registry: Arc<FolderRegistry>,
        hub: Arc<HubSearch>,
        scan_progress: Arc<RwLock<HashMap<String, ScanStatus>>>,
    ) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(NetworkConfig::URL_PROBE_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| ScoutError::Network {
                message: format!("Failed to create probe HTTP client: {}", e),
                cause: None,
            })?;

        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ScoutError::Config {
                message: format!("Invalid scanner pattern: {}", e),
            })
        };

        Ok(Self {
            registry,
            hub,
            probe_client,
            scan_progress,
            validate_urls: true,
            markdown_link: compile(r"\[([^\]]+)\]\(([^)]+)\)")?,
            bare_url: compile(r"https?://(?:huggingface\.co|hf\.co|civitai\.com)/[^\s)\]]+")?,
            hf_file: compile(r"huggingface\.co/([^/]+/[^/]+)/(?:blob|resolve|tree)/([^/]+)/(.+)")?,
            civitai_direct: compile(r"civitai\.com/api/download/models/\d+")?,
        })
    }

    /// Disable the HEAD probe over resolved URLs. Resolved entries are then
    /// returned as-is.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_urls = validate;
        self
    }

    /// Scan a workflow for missing assets, correcting stale paths in place.
    ///
    /// Never fails: per-model resolution errors are logged and the model
    /// lands in `not_found_models` instead.
    pub async fn find_missing_models(&self, workflow: &mut Workflow) -> ScanResult {
        self.scan_progress
            .write()
            .await
            .insert(ScanConfig::CURRENT_SCAN_ID.to_string(), ScanStatus::starting());

        let mut missing: Vec<MissingModel> = Vec::new();
        let mut missing_no_url: Vec<MissingModel> = Vec::new();
        let mut corrections: Vec<Correction> = Vec::new();

        // Split borrows: node passes mutate `nodes` while reading `extra`.
        let Workflow { nodes, extra, .. } = workflow;
        let total_nodes = nodes.len();

        for (node_idx, node) in nodes.iter_mut().enumerate() {
            let has_descriptor_list =
                self.scan_node_properties(node, &mut missing, &mut corrections);
            if !has_descriptor_list {
                self.scan_node_widgets(
                    node,
                    extra,
                    &mut missing,
                    &mut missing_no_url,
                    &mut corrections,
                );
            }

            if total_nodes > 0 {
                let progress = (((node_idx + 1) * 33) / total_nodes) as u8;
                self.update_progress(
                    ScanStage::Nodes,
                    progress,
                    format!("Scanning workflow nodes ({}/{})...", node_idx + 1, total_nodes),
                )
                .await;
            }
        }

        self.update_progress(ScanStage::Metadata, 33, "Checking workflow metadata...".into())
            .await;
        self.scan_workflow_metadata(extra, &mut missing, &mut missing_no_url, &mut corrections);

        let unique_missing = dedup_missing(missing);
        let unique_no_url = dedup_missing(missing_no_url);
        let unique_corrections = dedup_corrections(corrections);

        self.update_progress(ScanStage::Resolving, 66, "Resolving model URLs...".into())
            .await;
        let (resolved, mut not_found) = self
            .resolve_missing_urls(nodes, unique_no_url)
            .await;

        let mut ready: Vec<MissingModel> = unique_missing;
        ready.extend(resolved);

        if self.validate_urls && !ready.is_empty() {
            self.update_progress(ScanStage::Validating, 87, "Validating model URLs...".into())
                .await;
            let mut validated = Vec::new();
            for model in ready {
                match self.validate_and_resolve(model).await {
                    Ok(model) => validated.push(model),
                    Err(model) => {
                        let mut model = model;
                        model.not_found_reason =
                            Some("URL validation failed and remote search found nothing".into());
                        not_found.push(model);
                    }
                }
            }
            ready = validated;
        }

        if let Some(status) = self
            .scan_progress
            .write()
            .await
            .get_mut(ScanConfig::CURRENT_SCAN_ID)
        {
            status.state = ScanState::Complete;
            status.stage = ScanStage::Complete;
            status.progress = 100;
            status.message = "Scan complete".into();
        }

        info!(
            "Scan complete: {} missing, {} not found, {} corrected",
            ready.len(),
            not_found.len(),
            unique_corrections.len()
        );

        ScanResult {
            missing_models: ready,
            not_found_models: not_found,
            corrected_models: unique_corrections,
        }
    }

    /// Structured descriptor pass. Returns true when the node declares a
    /// descriptor list, which suppresses the widget pass for that node.
    fn scan_node_properties(
        &self,
        node: &mut Node,
        missing: &mut Vec<MissingModel>,
        corrections: &mut Vec<Correction>,
    ) -> bool {
        let node_id = node.id;
        let node_type = node.node_type.clone();
        let Some(descriptors) = node.properties.models.as_mut() else {
            return false;
        };

        for (property_idx, descriptor) in descriptors.iter_mut().enumerate() {
            let name = match descriptor.name.as_deref() {
                Some(n) if !n.trim().is_empty() => n.to_string(),
                _ => continue,
            };
            let category = descriptor.category().to_string();

            if self.registry.is_installed(&name, &category) {
                continue;
            }

            if let Some(actual) = self.registry.find_actual_path(&name, &category) {
                descriptor.name = Some(actual.clone());
                corrections.push(Correction {
                    name: file_basename(&name),
                    old_path: name,
                    new_path: actual,
                    category,
                    node_id,
                    node_type: node_type.clone(),
                    site: CorrectionSite::Property(property_idx),
                });
            } else if let Some(url) = descriptor.url.clone() {
                let Ok(mut model) = MissingModel::new(name, category) else {
                    continue;
                };
                model.node_id = node_id;
                model.node_type = node_type.clone();
                model.site = Some(CorrectionSite::Property(property_idx));
                model.url = Some(url);
                model.url_source = UrlSource::Embedded;
                missing.push(model);
            }
        }
        true
    }

    /// Free widget-value pass for nodes without a descriptor list.
    fn scan_node_widgets(
        &self,
        node: &mut Node,
        extra: &WorkflowExtra,
        missing: &mut Vec<MissingModel>,
        missing_no_url: &mut Vec<MissingModel>,
        corrections: &mut Vec<Correction>,
    ) {
        let node_id = node.id;
        let node_type = node.node_type.clone();
        let model_url_property = node.properties.model_url.clone();

        for (widget_idx, widget_value) in node.widgets_values.iter_mut().enumerate() {
            let name = match widget_value.as_str() {
                Some(v) if is_model_reference(v) => v.to_string(),
                _ => continue,
            };

            if let Some((actual, found_category)) =
                self.registry.find_in_all_categories(&name, &[])
            {
                if normalize_path(&actual) == normalize_path(&name) {
                    debug!("Already at correct path, skipping: {}", actual);
                    continue;
                }
                *widget_value = Value::String(actual.clone());
                info!(
                    "Corrected path: {} -> {} (node {:?}, widget {})",
                    name, actual, node_id, widget_idx
                );
                corrections.push(Correction {
                    name: file_basename(&name),
                    old_path: name,
                    new_path: actual,
                    category: found_category,
                    node_id,
                    node_type: node_type.clone(),
                    site: CorrectionSite::Widget(widget_idx),
                });
                continue;
            }

            let url = model_url_property.clone().or_else(|| {
                extra.model_urls.get(&name).and_then(|entry| entry.url.clone())
            });
            let inferred = node_type
                .as_deref()
                .and_then(|t| self.registry.category_from_node_type(t));
            let category = inferred.unwrap_or("checkpoints");

            let Ok(mut model) = MissingModel::new(name, category) else {
                continue;
            };
            model.node_id = node_id;
            model.node_type = node_type.clone();
            model.site = Some(CorrectionSite::Widget(widget_idx));
            model.needs_category_selection = inferred.is_none();
            if let Some(url) = url {
                model.url = Some(url);
                model.url_source = UrlSource::Embedded;
                missing.push(model);
            } else {
                missing_no_url.push(model);
            }
        }
    }

    /// Workflow-level `extra.model_urls` map pass.
    fn scan_workflow_metadata(
        &self,
        extra: &WorkflowExtra,
        missing: &mut Vec<MissingModel>,
        missing_no_url: &mut Vec<MissingModel>,
        corrections: &mut Vec<Correction>,
    ) {
        for (name, entry) in &extra.model_urls {
            let category = entry.category().to_string();
            if self.registry.is_installed(name, &category) {
                continue;
            }

            if let Some(actual) = self.registry.find_actual_path(name, &category) {
                corrections.push(Correction {
                    name: file_basename(name),
                    old_path: name.clone(),
                    new_path: actual,
                    category,
                    node_id: None,
                    node_type: None,
                    site: CorrectionSite::Metadata,
                });
                continue;
            }

            let Ok(mut model) = MissingModel::new(name.clone(), category) else {
                continue;
            };
            model.site = Some(CorrectionSite::Metadata);
            if let Some(url) = entry.url.clone() {
                model.url = Some(url);
                model.url_source = UrlSource::Embedded;
                missing.push(model);
            } else {
                missing_no_url.push(model);
            }
        }
    }

    /// Resolve URLs for models that had none embedded: note links first, then
    /// the remote hub. Returns `(resolved, not_found)`.
    async fn resolve_missing_urls(
        &self,
        nodes: &[Node],
        mut models: Vec<MissingModel>,
    ) -> (Vec<MissingModel>, Vec<MissingModel>) {
        if models.is_empty() {
            return (Vec::new(), Vec::new());
        }
        info!("Attempting to resolve URLs for {} model(s)", models.len());

        let mut note_urls = self.extract_urls_from_notes(nodes);
        if !note_urls.is_empty() {
            match_note_urls(&mut models, &mut note_urls);
        }

        let still_missing = models.iter().filter(|m| m.url.is_none()).count();
        info!(
            "After note matching: {} model(s) still need URLs",
            still_missing
        );

        let mut search_idx = 0usize;
        for model in models.iter_mut().filter(|m| m.url.is_none()) {
            if still_missing > 0 {
                let progress = 66 + ((search_idx * 21) / still_missing) as u8;
                self.update_progress(
                    ScanStage::Resolving,
                    progress,
                    format!("Resolving model URLs ({}/{})...", search_idx + 1, still_missing),
                )
                .await;
            }
            search_idx += 1;

            let filename = file_basename(&model.name);
            let results = self.hub.search_filename(&filename).await;
            match results.best() {
                Some(found) => {
                    model.url = Some(found.download_url.clone());
                    model.url_source = UrlSource::RemoteSearch;
                    model.expected_filename = Some(found.expected_filename.clone());
                    model.actual_filename = Some(found.actual_filename.clone());
                    if found.actual_filename != found.expected_filename {
                        info!(
                            "Found {} as {} in {} (will rename)",
                            found.expected_filename, found.actual_filename, found.repo_id
                        );
                    } else {
                        info!("Found {} in {}", filename, found.repo_id);
                    }
                }
                None => info!("Not found: {}", filename),
            }
        }

        let (resolved, not_found): (Vec<_>, Vec<_>) =
            models.into_iter().partition(|m| m.url.is_some());
        info!(
            "Resolution complete: {} resolved, {} not found",
            resolved.len(),
            not_found.len()
        );
        (resolved, not_found)
    }

    /// Probe a model's URL and fall back to one remote re-search when the
    /// probe fails. `Err` carries the model back for the not-found list.
    async fn validate_and_resolve(
        &self,
        mut model: MissingModel,
    ) -> std::result::Result<MissingModel, MissingModel> {
        let url = match model.url.clone() {
            Some(url) => url,
            None => return self.auto_search(model).await,
        };

        if self.probe_url(&url).await {
            return Ok(model);
        }

        info!("URL invalid: {}", url);
        model.original_url = Some(url);
        self.auto_search(model).await
    }

    async fn auto_search(
        &self,
        mut model: MissingModel,
    ) -> std::result::Result<MissingModel, MissingModel> {
        let filename = file_basename(&model.name);
        let results = self.hub.search_filename(&filename).await;
        match results.best() {
            Some(found) => {
                info!("Auto-found replacement: {}", found.download_url);
                model.url = Some(found.download_url.clone());
                model.url_source = UrlSource::RemoteSearch;
                model.expected_filename = Some(found.expected_filename.clone());
                model.actual_filename = Some(found.actual_filename.clone());
                Ok(model)
            }
            None => {
                info!("Could not find {} on the hub", model.name);
                model.url = None;
                Err(model)
            }
        }
    }

    /// HEAD probe; any transport failure or >=400 status counts as invalid.
    async fn probe_url(&self, url: &str) -> bool {
        match self.probe_client.head(url).send().await {
            Ok(response) => response.status().as_u16() < 400,
            Err(e) => {
                warn!("URL validation failed for {}: {}", url, e);
                false
            }
        }
    }

    /// Pull candidate download URLs out of note nodes. Markdown link targets
    /// and bare URLs, restricted to the known hosts, parsed down to direct
    /// download URLs.
    fn extract_urls_from_notes(&self, nodes: &[Node]) -> Vec<NoteUrl> {
        let mut raw: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let push = |url: &str, seen: &mut HashSet<String>, raw: &mut Vec<String>| {
            let url = url.trim().to_string();
            if seen.insert(url.clone()) {
                raw.push(url);
            }
        };

        for node in nodes {
            let Some(text) = node.note_text() else { continue };

            for captures in self.markdown_link.captures_iter(text) {
                let url = captures[2].trim();
                if ["huggingface.co", "hf.co", "civitai.com"]
                    .iter()
                    .any(|host| url.contains(host))
                {
                    push(url, &mut seen, &mut raw);
                }
            }
            for found in self.bare_url.find_iter(text) {
                push(found.as_str(), &mut seen, &mut raw);
            }
        }
        info!("Extracted {} URL(s) from notes", raw.len());

        let parsed: Vec<NoteUrl> = raw
            .iter()
            .filter_map(|url| {
                self.parse_hf_url(url)
                    .or_else(|| self.parse_civitai_url(url))
            })
            .collect();
        info!("Parsed {} download URL(s) from notes", parsed.len());
        parsed
    }

    /// Canonicalize a hub file URL (`blob`, `resolve`, or `tree` form) into a
    /// direct `resolve` download URL. `hf.co` short links are accepted.
    fn parse_hf_url(&self, url: &str) -> Option<NoteUrl> {
        let url = url.replace("hf.co/", "huggingface.co/");
        let captures = self.hf_file.captures(&url)?;
        let repo_id = &captures[1];
        let branch = &captures[2];
        let file_path = captures[3]
            .split(['?', '#'])
            .next()
            .unwrap_or(&captures[3])
            .to_string();
        Some(NoteUrl {
            filename: Some(file_basename(&file_path)),
            download_url: format!(
                "https://huggingface.co/{}/resolve/{}/{}",
                repo_id, branch, file_path
            ),
        })
    }

    /// Only direct version-download URLs are usable; model-page URLs carry no
    /// filename to match against.
    fn parse_civitai_url(&self, url: &str) -> Option<NoteUrl> {
        if self.civitai_direct.is_match(url) {
            Some(NoteUrl {
                filename: None,
                download_url: url.to_string(),
            })
        } else {
            None
        }
    }

    async fn update_progress(&self, stage: ScanStage, progress: u8, message: String) {
        if let Some(status) = self
            .scan_progress
            .write()
            .await
            .get_mut(ScanConfig::CURRENT_SCAN_ID)
        {
            status.stage = stage;
            status.progress = progress;
            status.message = message;
        }
    }
}

/// A widget value counts as a model reference iff it is a string of
/// reasonable length with a recognized asset extension.
fn is_model_reference(value: &str) -> bool {
    if value.len() < ScanConfig::MIN_REFERENCE_LEN {
        return false;
    }
    let lower = value.to_lowercase();
    ScanConfig::MODEL_FILE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Collapse duplicate `(name, category)` entries, accumulating every usage
/// on the surviving entry.
fn dedup_missing(models: Vec<MissingModel>) -> Vec<MissingModel> {
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    let mut unique: Vec<MissingModel> = Vec::new();

    for mut model in models {
        let key = model.dedup_key();
        match seen.get(&key) {
            Some(&idx) => {
                let usage = model.usage();
                unique[idx].related_usages.push(usage);
                // Manual selection is only needed when no usage could infer
                // a category.
                unique[idx].needs_category_selection &= model.needs_category_selection;
            }
            None => {
                model.related_usages = vec![model.usage()];
                seen.insert(key, unique.len());
                unique.push(model);
            }
        }
    }
    unique
}

fn dedup_corrections(corrections: Vec<Correction>) -> Vec<Correction> {
    let mut seen = HashSet::new();
    corrections
        .into_iter()
        .filter(|c| seen.insert(c.dedup_key()))
        .collect()
}

/// Attach note URLs to unresolved models by case-insensitive basename. Each
/// note URL is consumed by the first model it matches.
fn match_note_urls(models: &mut [MissingModel], note_urls: &mut Vec<NoteUrl>) -> usize {
    let mut matched = 0;
    for model in models.iter_mut().filter(|m| m.url.is_none()) {
        let wanted = file_basename(&model.name).to_lowercase();
        let found = note_urls.iter().position(|n| {
            n.filename
                .as_deref()
                .map(|f| f.to_lowercase() == wanted)
                .unwrap_or(false)
        });
        if let Some(idx) = found {
            let note = note_urls.remove(idx);
            info!("Matched '{}' to note URL: {}", wanted, note.download_url);
            model.url = Some(note.download_url);
            model.url_source = UrlSource::Note;
            matched += 1;
        }
    }
    info!("Matched {} model(s) from note URLs", matched);
    matched
}
