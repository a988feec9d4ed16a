//! Remote hub search with persistent repository-listing cache.
//!
//! Searches a fixed, ordered list of sources (single repositories or owners
//! whose repositories are enumerated on demand) for a filename. Repository
//! file listings are cached on disk keyed by repository id and invalidated by
//! the repository's last-modified timestamp. Exact basename matches rank
//! first; fuzzy scoring only runs when no exact match exists anywhere.

use crate::config::{NetworkConfig, SearchConfig};
use crate::models::{file_basename, RepoCacheEntry};
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::{Result, ScoutError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// How a search result matched the requested filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

/// One file found on the hub for a searched filename.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HubMatch {
    pub repo_id: String,
    /// Path of the file within the repository.
    pub file_path: String,
    /// Basename the remote source stores the file under.
    pub actual_filename: String,
    /// Basename that was searched for.
    pub expected_filename: String,
    pub score: f64,
    pub match_kind: MatchKind,
    pub download_url: String,
}

/// Search outcome: exact matches in discovery order, or the top fuzzy
/// suggestions when nothing matched exactly.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SearchResults {
    pub exact_matches: Vec<HubMatch>,
    pub fuzzy_matches: Vec<HubMatch>,
}

impl SearchResults {
    /// Highest-ranked match: first exact, else best fuzzy.
    pub fn best(&self) -> Option<&HubMatch> {
        self.exact_matches.first().or(self.fuzzy_matches.first())
    }

    pub fn is_empty(&self) -> bool {
        self.exact_matches.is_empty() && self.fuzzy_matches.is_empty()
    }
}

/// Persisted repository-listing cache: a flat JSON map from repository id to
/// `{last_modified, files}`, rewritten atomically on every update. A missing
/// or corrupt file degrades to an empty cache.
pub struct RepoCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, RepoCacheEntry>>,
}

impl RepoCache {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match atomic_read_json::<HashMap<String, RepoCacheEntry>>(&path) {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("Unreadable repo cache at {}: {}", path.display(), e);
                HashMap::new()
            }
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, repo_id: &str) -> Option<RepoCacheEntry> {
        self.entries.read().ok()?.get(repo_id).cloned()
    }

    /// Insert or replace a repository's entry and persist the whole map.
    pub fn update(&self, repo_id: &str, entry: RepoCacheEntry) {
        let snapshot = {
            let mut entries = match self.entries.write() {
                Ok(e) => e,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.insert(repo_id.to_string(), entry);
            entries.clone()
        };
        if let Err(e) = atomic_write_json(&self.path, &snapshot) {
            warn!("Failed to persist repo cache: {}", e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct HubRepoListing {
    id: String,
    #[serde(rename = "lastModified")]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubRepoInfo {
    #[serde(rename = "lastModified")]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubTreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
}

/// Hub search client over the fixed source list.
pub struct HubSearch {
    client: reqwest::Client,
    api_base: String,
    resolve_base: String,
    sources: Vec<String>,
    cache: RepoCache,
}

impl HubSearch {
    /// Create a search client with the default source list and a persistent
    /// cache at `cache_file`.
    pub fn new(cache_file: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NetworkConfig::REQUEST_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| ScoutError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            api_base: SearchConfig::HUB_API_BASE.to_string(),
            resolve_base: SearchConfig::HUB_RESOLVE_BASE.to_string(),
            sources: SearchConfig::SOURCES.iter().map(|s| s.to_string()).collect(),
            cache: RepoCache::load(cache_file),
        })
    }

    /// Override endpoints and sources, for tests against a local stub hub.
    pub fn with_endpoints(
        mut self,
        api_base: impl Into<String>,
        resolve_base: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        self.api_base = api_base.into();
        self.resolve_base = resolve_base.into();
        self.sources = sources;
        self
    }

    /// Search the source list for a filename.
    ///
    /// Sources are processed strictly in order, one repository at a time;
    /// the first exact match ranks first even if later repositories also
    /// match exactly. Per-source errors are logged and skipped; this method
    /// itself never fails.
    pub async fn search_filename(&self, filename: &str) -> SearchResults {
        let search_filename = file_basename(filename);
        info!("Searching hub for: {}", search_filename);

        let mut exact_matches: Vec<HubMatch> = Vec::new();
        let mut fuzzy_candidates: Vec<HubMatch> = Vec::new();

        for source in &self.sources {
            let repos: Vec<(String, Option<String>)> = if source.contains('/') {
                vec![(source.clone(), None)]
            } else {
                match self.list_owner_repos(source).await {
                    Ok(repos) => repos,
                    Err(e) => {
                        warn!("Error listing repos for {}: {}", source, e);
                        continue;
                    }
                }
            };

            for (repo_id, last_modified) in repos {
                let files = match self
                    .fetch_repo_files_with_cache(&repo_id, last_modified)
                    .await
                {
                    Ok(files) => files,
                    Err(e) => {
                        warn!("Error processing {}: {}", repo_id, e);
                        continue;
                    }
                };
                let (exact, fuzzy) =
                    self.match_files_in_repo(&files, &search_filename, &repo_id);
                exact_matches.extend(exact);
                fuzzy_candidates.extend(fuzzy);
            }
        }

        if !exact_matches.is_empty() {
            info!("Found {} exact match(es)", exact_matches.len());
            return SearchResults {
                exact_matches,
                fuzzy_matches: Vec::new(),
            };
        }

        fuzzy_candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        fuzzy_candidates.truncate(SearchConfig::MAX_FUZZY_RESULTS);
        if fuzzy_candidates.is_empty() {
            info!("No similar files found in cached repos");
        } else {
            info!(
                "No exact matches, returning {} fuzzy suggestion(s)",
                fuzzy_candidates.len()
            );
        }
        SearchResults {
            exact_matches: Vec::new(),
            fuzzy_matches: fuzzy_candidates,
        }
    }

    /// List an owner's repositories with their last-modified timestamps.
    async fn list_owner_repos(&self, owner: &str) -> Result<Vec<(String, Option<String>)>> {
        let url = format!(
            "{}/models?author={}&expand[]=lastModified",
            self.api_base,
            urlencoding::encode(owner)
        );
        let listings: Vec<HubRepoListing> = self.get_json(&url).await?;
        Ok(listings
            .into_iter()
            .map(|l| (l.id, l.last_modified))
            .collect())
    }

    /// Fetch a repository's file list, via the cache when the repository's
    /// last-modified timestamp matches the cached entry.
    async fn fetch_repo_files_with_cache(
        &self,
        repo_id: &str,
        last_modified: Option<String>,
    ) -> Result<Vec<String>> {
        let last_modified = match last_modified {
            Some(lm) => Some(lm),
            None => match self.fetch_repo_last_modified(repo_id).await {
                Ok(lm) => lm,
                Err(e) => {
                    warn!("Could not fetch lastModified for {}: {}", repo_id, e);
                    None
                }
            },
        };

        if let (Some(entry), Some(lm)) = (self.cache.get(repo_id), last_modified.as_ref()) {
            if entry.last_modified == *lm {
                debug!("Repo cache hit for {}", repo_id);
                return Ok(entry.files);
            }
        }

        let files = self.fetch_repo_files(repo_id).await?;
        match last_modified {
            Some(lm) => self.cache.update(
                repo_id,
                RepoCacheEntry {
                    last_modified: lm,
                    files: files.clone(),
                },
            ),
            None => warn!("No last_modified for {}, not caching", repo_id),
        }
        Ok(files)
    }

    async fn fetch_repo_last_modified(&self, repo_id: &str) -> Result<Option<String>> {
        let url = format!("{}/models/{}", self.api_base, repo_id);
        let info: HubRepoInfo = self.get_json(&url).await?;
        Ok(info.last_modified)
    }

    async fn fetch_repo_files(&self, repo_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/models/{}/tree/main?recursive=true", self.api_base, repo_id);
        let entries: Vec<HubTreeEntry> = self.get_json(&url).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| e.path)
            .collect())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScoutError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    /// Exact matches within one repository, or fuzzy candidates above the
    /// score threshold when the repository holds no exact match.
    fn match_files_in_repo(
        &self,
        files: &[String],
        search_filename: &str,
        repo_id: &str,
    ) -> (Vec<HubMatch>, Vec<HubMatch>) {
        let target_lower = search_filename.to_lowercase();

        let exact: Vec<HubMatch> = files
            .iter()
            .filter(|f| file_basename(f).to_lowercase() == target_lower)
            .map(|f| self.make_match(repo_id, f, search_filename, 1.0, MatchKind::Exact))
            .collect();
        if !exact.is_empty() {
            return (exact, Vec::new());
        }

        let fuzzy: Vec<HubMatch> = files
            .iter()
            .filter_map(|f| {
                let score = compute_similarity(&file_basename(f), search_filename);
                if score >= SearchConfig::MIN_FUZZY_SCORE {
                    Some(self.make_match(repo_id, f, search_filename, score, MatchKind::Fuzzy))
                } else {
                    None
                }
            })
            .collect();
        (Vec::new(), fuzzy)
    }

    fn make_match(
        &self,
        repo_id: &str,
        file_path: &str,
        search_filename: &str,
        score: f64,
        match_kind: MatchKind,
    ) -> HubMatch {
        HubMatch {
            repo_id: repo_id.to_string(),
            file_path: file_path.to_string(),
            actual_filename: file_basename(file_path),
            expected_filename: search_filename.to_string(),
            score,
            match_kind,
            download_url: format!(
                "{}/{}/resolve/main/{}",
                self.resolve_base, repo_id, file_path
            ),
        }
    }
}

/// Similarity between two basenames in `[0, 1]`, symmetric in its arguments.
///
/// Combines the raw character-sequence ratio with the ratio after stripping
/// separator characters (a pure separator-style difference counts almost as
/// a match), plus a small bonus when one name is a prefix of the other.
pub fn compute_similarity(a: &str, b: &str) -> f64 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let base_ratio = sequence_ratio(&a_lower, &b_lower);

    let a_simple = strip_delimiters(&a_lower);
    let b_simple = strip_delimiters(&b_lower);
    let mut simple_ratio = sequence_ratio(&a_simple, &b_simple);
    if a_simple == b_simple {
        simple_ratio = simple_ratio.max(0.95);
    }

    let prefix_bonus = if a_lower.starts_with(&b_lower) || b_lower.starts_with(&a_lower) {
        0.05
    } else {
        0.0
    };

    (base_ratio.max(simple_ratio) + prefix_bonus).min(1.0)
}

fn strip_delimiters(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect()
}

/// Character-sequence similarity: `2 * lcs(a, b) / (|a| + |b|)`.
fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() && b_chars.is_empty() {
        return 1.0;
    }
    if a_chars.is_empty() || b_chars.is_empty() {
        return 0.0;
    }

    // Longest common subsequence, two-row DP.
    let mut prev = vec![0usize; b_chars.len() + 1];
    let mut curr = vec![0usize; b_chars.len() + 1];
    for &ca in &a_chars {
        for (j, &cb) in b_chars.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b_chars.len()];
    (2.0 * lcs as f64) / ((a_chars.len() + b_chars.len()) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_similarity_symmetry() {
        let pairs = [
            ("wan_vae.safetensors", "wan-vae.safetensors"),
            ("model_fp16.gguf", "model_fp8.gguf"),
            ("a.ckpt", "completely_different.pt"),
        ];
        for (a, b) in pairs {
            let ab = compute_similarity(a, b);
            let ba = compute_similarity(b, a);
            assert!((ab - ba).abs() < 1e-12, "asymmetric for {a} / {b}");
        }
    }

    #[test]
    fn test_similarity_identical_is_one() {
        assert_eq!(compute_similarity("model.safetensors", "model.safetensors"), 1.0);
    }

    #[test]
    fn test_similarity_separator_difference_scores_high() {
        let score = compute_similarity("wan_vae_fp16.safetensors", "wan-vae-fp16.safetensors");
        assert!(score >= 0.95, "got {score}");
    }

    #[test]
    fn test_similarity_prefix_bonus_capped() {
        // Identical names already score 1.0; the bonus must not exceed it.
        assert!(compute_similarity("abc", "abc") <= 1.0);
        let with_prefix = compute_similarity("model", "model_v2");
        let without = sequence_ratio("model", "model_v2");
        assert!(with_prefix > without);
    }

    #[test]
    fn test_similarity_unrelated_below_threshold() {
        let score = compute_similarity("zzzz.gguf", "totally_other_name.safetensors");
        assert!(score < SearchConfig::MIN_FUZZY_SCORE);
    }

    fn test_search(temp: &TempDir) -> HubSearch {
        HubSearch::new(temp.path().join("repo-cache.json"))
            .unwrap()
            .with_endpoints("http://unused", "http://unused", vec![])
    }

    #[test]
    fn test_match_files_exact_skips_fuzzy() {
        let temp = TempDir::new().unwrap();
        let search = test_search(&temp);

        let files = vec![
            "sub/Weights.safetensors".to_string(),
            "weights_v2.safetensors".to_string(),
        ];
        let (exact, fuzzy) =
            search.match_files_in_repo(&files, "weights.safetensors", "org/repo");
        assert_eq!(exact.len(), 1);
        assert!(fuzzy.is_empty());
        assert_eq!(exact[0].actual_filename, "Weights.safetensors");
        assert_eq!(exact[0].match_kind, MatchKind::Exact);
        assert_eq!(
            exact[0].download_url,
            "http://unused/org/repo/resolve/main/sub/Weights.safetensors"
        );
    }

    #[test]
    fn test_match_files_fuzzy_thresholded() {
        let temp = TempDir::new().unwrap();
        let search = test_search(&temp);

        let files = vec![
            "wan-vae-fp16.safetensors".to_string(),
            "unrelated_thing.bin".to_string(),
        ];
        let (exact, fuzzy) =
            search.match_files_in_repo(&files, "wan_vae_fp16.safetensors", "org/repo");
        assert!(exact.is_empty());
        assert_eq!(fuzzy.len(), 1);
        assert!(fuzzy[0].score >= SearchConfig::MIN_FUZZY_SCORE);
    }

    #[test]
    fn test_repo_cache_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repo-cache.json");

        let cache = RepoCache::load(&path);
        assert!(cache.get("org/repo").is_none());

        cache.update(
            "org/repo",
            RepoCacheEntry {
                last_modified: "2025-06-01T00:00:00Z".into(),
                files: vec!["a.safetensors".into()],
            },
        );

        // A fresh load observes the persisted entry.
        let reloaded = RepoCache::load(&path);
        let entry = reloaded.get("org/repo").unwrap();
        assert_eq!(entry.last_modified, "2025-06-01T00:00:00Z");
        assert_eq!(entry.files, vec!["a.safetensors".to_string()]);
    }

    #[tokio::test]
    async fn test_search_short_circuits_on_unchanged_last_modified() {
        use axum::routing::get;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let tree_fetches = Arc::new(AtomicUsize::new(0));
        let counter = tree_fetches.clone();

        let app = axum::Router::new()
            .route(
                "/models/:owner/:repo",
                get(|| async {
                    axum::Json(serde_json::json!({"lastModified": "2025-06-01T00:00:00Z"}))
                }),
            )
            .route(
                "/models/:owner/:repo/tree/main",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        axum::Json(serde_json::json!([
                            {"type": "file", "path": "sub/weights.safetensors"},
                            {"type": "directory", "path": "sub"}
                        ]))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let temp = TempDir::new().unwrap();
        let search = HubSearch::new(temp.path().join("repo-cache.json"))
            .unwrap()
            .with_endpoints(
                format!("http://{}", addr),
                format!("http://{}", addr),
                vec!["org/repo".to_string()],
            );

        let first = search.search_filename("weights.safetensors").await;
        assert_eq!(first.exact_matches.len(), 1);
        assert_eq!(
            first.exact_matches[0].download_url,
            format!("http://{}/org/repo/resolve/main/sub/weights.safetensors", addr)
        );
        assert_eq!(tree_fetches.load(Ordering::SeqCst), 1);

        // Unchanged lastModified: the second search serves files from the
        // cache and never refetches the tree.
        let second = search.search_filename("weights.safetensors").await;
        assert_eq!(second.exact_matches.len(), 1);
        assert_eq!(tree_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repo_cache_corrupt_file_degrades_to_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repo-cache.json");
        std::fs::write(&path, b"{not json").unwrap();

        let cache = RepoCache::load(&path);
        assert!(cache.get("org/repo").is_none());
    }
}
