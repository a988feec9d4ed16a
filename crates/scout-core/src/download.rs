//! Download manager with byte-accurate progress, cooperative cancellation,
//! and atomic file placement.
//!
//! Each job runs as an independent task streaming into a temp file that is
//! renamed into place only on success. At most one task is active per output
//! filename; starting a duplicate cancels and drains the prior task first.

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::models::{normalize_path, DownloadJob, DownloadState, DownloadStatus};
use crate::registry::FolderRegistry;
use crate::{Result, ScoutError};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

struct ActiveTask {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Handles download jobs and progress tracking.
pub struct DownloadManager {
    client: reqwest::Client,
    registry: Arc<FolderRegistry>,
    progress: Arc<RwLock<HashMap<String, DownloadStatus>>>,
    tasks: Arc<Mutex<HashMap<String, ActiveTask>>>,
}

impl DownloadManager {
    pub fn new(registry: Arc<FolderRegistry>) -> Result<Self> {
        // Connect timeout only: a total timeout would kill multi-gigabyte
        // downloads. The stream loop handles progress and cancellation.
        let client = reqwest::Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| ScoutError::Network {
                message: format!("Failed to create download HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            registry,
            progress: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Status of one download, by expected filename.
    pub async fn progress(&self, name: &str) -> Option<DownloadStatus> {
        self.progress.read().await.get(&normalize_path(name)).cloned()
    }

    /// Status of every download started during this service's lifetime.
    pub async fn all_progress(&self) -> HashMap<String, DownloadStatus> {
        self.progress.read().await.clone()
    }

    /// Request cancellation of an active download. Returns false when no
    /// task is running under that filename.
    pub async fn cancel(&self, name: &str) -> bool {
        let tasks = self.tasks.lock().await;
        match tasks.get(&normalize_path(name)) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Start a download job.
    ///
    /// If a task is already running for the same expected filename it is
    /// cancelled and drained before the new task starts, so two tasks never
    /// race on the same temp file.
    pub async fn start(&self, job: DownloadJob) {
        let name = normalize_path(&job.expected_filename);

        let prior = self.tasks.lock().await.remove(&name);
        if let Some(prior) = prior {
            info!("Restarting download for {}, cancelling prior task", name);
            prior.token.cancel();
            let _ = prior.handle.await;
        }

        let token = CancellationToken::new();
        let client = self.client.clone();
        let registry = self.registry.clone();
        let progress = self.progress.clone();
        let tasks = self.tasks.clone();
        let task_token = token.clone();
        let task_name = name.clone();

        // The task's self-removal takes this lock, so even a job that fails
        // instantly cannot remove its entry before it has been inserted.
        let mut table = self.tasks.lock().await;
        let handle = tokio::spawn(async move {
            run_job(client, registry, progress, &task_name, &job, task_token).await;
            tasks.lock().await.remove(&task_name);
        });
        table.insert(name, ActiveTask { handle, token });
    }

    /// Wait until no task is running for this filename. Test helper; the
    /// HTTP boundary polls status instead.
    pub async fn wait_for(&self, name: &str) {
        let name = normalize_path(name);
        loop {
            if !self.tasks.lock().await.contains_key(&name) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

/// One download job from start to terminal status. Every exit path removes
/// the temp file unless it was renamed into place.
async fn run_job(
    client: reqwest::Client,
    registry: Arc<FolderRegistry>,
    progress: Arc<RwLock<HashMap<String, DownloadStatus>>>,
    name: &str,
    job: &DownloadJob,
    token: CancellationToken,
) {
    if let Some(actual) = &job.actual_filename {
        let actual = normalize_path(actual);
        if actual != name {
            info!("Will save '{}' as '{}'", actual, name);
        }
    }

    progress
        .write()
        .await
        .insert(name.to_string(), DownloadStatus::started());

    let dest_dir = registry.destination_path(&job.category);
    let dest_path = dest_dir.join(name);
    let temp_path = dest_dir.join(format!("{}{}", name, NetworkConfig::DOWNLOAD_TEMP_SUFFIX));

    let result = stream_to_temp(
        &client,
        &job.download_url,
        &temp_path,
        &progress,
        name,
        &token,
    )
    .await;

    match result {
        Ok(downloaded) => {
            let finalize = async {
                if tokio::fs::try_exists(&dest_path).await.unwrap_or(false) {
                    tokio::fs::remove_file(&dest_path)
                        .await
                        .map_err(|e| ScoutError::io_with_path(e, &dest_path))?;
                }
                tokio::fs::rename(&temp_path, &dest_path)
                    .await
                    .map_err(|e| ScoutError::io_with_path(e, &dest_path))?;
                Ok::<(), ScoutError>(())
            };
            match finalize.await {
                Ok(()) => {
                    let mut progress = progress.write().await;
                    if let Some(status) = progress.get_mut(name) {
                        status.state = DownloadState::Completed;
                        status.progress = 100.0;
                        status.downloaded = downloaded;
                    }
                    info!(
                        "Downloaded {} ({:.2} MB)",
                        name,
                        downloaded as f64 / 1024.0 / 1024.0
                    );
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    set_error(&progress, name, &e.to_string()).await;
                    error!("Error finalizing {}: {}", name, e);
                }
            }
        }
        Err(ScoutError::DownloadCancelled) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            let mut progress = progress.write().await;
            if let Some(status) = progress.get_mut(name) {
                status.state = DownloadState::Cancelled;
            }
            info!("Download cancelled for {}", name);
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            set_error(&progress, name, &e.to_string()).await;
            error!("Error downloading {}: {}", name, e);
        }
    }
}

async fn set_error(
    progress: &Arc<RwLock<HashMap<String, DownloadStatus>>>,
    name: &str,
    message: &str,
) {
    let mut progress = progress.write().await;
    if let Some(status) = progress.get_mut(name) {
        status.state = DownloadState::Error;
        status.error = Some(message.to_string());
    }
}

/// Stream the response body into the temp file, recording progress every
/// `DOWNLOAD_PROGRESS_BYTES` and checking cancellation at chunk boundaries.
async fn stream_to_temp(
    client: &reqwest::Client,
    url: &str,
    temp_path: &Path,
    progress: &Arc<RwLock<HashMap<String, DownloadStatus>>>,
    name: &str,
    token: &CancellationToken,
) -> Result<u64> {
    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ScoutError::io_with_path(e, parent))?;
    }

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ScoutError::DownloadFailed {
            url: url.to_string(),
            message: format!("HTTP {}", status),
        });
    }

    let total = response.content_length().unwrap_or(0);
    {
        let mut progress = progress.write().await;
        if let Some(entry) = progress.get_mut(name) {
            entry.total = total;
        }
    }

    let mut file = tokio::fs::File::create(temp_path)
        .await
        .map_err(|e| ScoutError::io_with_path(e, temp_path))?;

    let mut downloaded: u64 = 0;
    let mut last_update: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        token.check()?;

        let chunk = chunk.map_err(|e| ScoutError::Network {
            message: format!("Error reading download stream: {}", e),
            cause: Some(e.to_string()),
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| ScoutError::io_with_path(e, temp_path))?;
        downloaded += chunk.len() as u64;

        let complete = total > 0 && downloaded >= total;
        if downloaded - last_update >= NetworkConfig::DOWNLOAD_PROGRESS_BYTES || complete {
            let mut progress = progress.write().await;
            if let Some(entry) = progress.get_mut(name) {
                entry.downloaded = downloaded;
                entry.progress = if total > 0 {
                    ((downloaded as f64 / total as f64) * 100.0 * 100.0).round() / 100.0
                } else {
                    0.0
                };
            }
            last_update = downloaded;
        }
    }

    file.flush()
        .await
        .map_err(|e| ScoutError::io_with_path(e, temp_path))?;

    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::MemoryStore;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use tempfile::TempDir;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn manager_for(dir: &TempDir) -> DownloadManager {
        let mut store = MemoryStore::new(&[("loras", &[])]);
        store
            .paths
            .insert("loras".into(), vec![dir.path().join("loras")]);
        let registry = Arc::new(FolderRegistry::new(
            Arc::new(store),
            dir.path().to_path_buf(),
        ));
        DownloadManager::new(registry).unwrap()
    }

    #[tokio::test]
    async fn test_completed_download_is_atomic() {
        let body = vec![7u8; 64 * 1024];
        let payload = body.clone();
        let addr = serve(Router::new().route(
            "/file",
            get(move || {
                let payload = payload.clone();
                async move { payload }
            }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);
        let job = DownloadJob::new(
            "lora_z.safetensors",
            format!("http://{}/file", addr),
            "loras",
        )
        .unwrap();

        manager.start(job).await;
        manager.wait_for("lora_z.safetensors").await;

        let status = manager.progress("lora_z.safetensors").await.unwrap();
        assert_eq!(status.state, DownloadState::Completed);
        assert_eq!(status.progress, 100.0);
        assert_eq!(status.downloaded, body.len() as u64);

        let dest = dir.path().join("loras").join("lora_z.safetensors");
        assert_eq!(
            std::fs::metadata(&dest).unwrap().len(),
            status.downloaded
        );
        let temp: PathBuf = dir.path().join("loras").join("lora_z.safetensors.tmp");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_nothing_behind() {
        // Endless stream so the download never completes on its own.
        let addr = serve(Router::new().route(
            "/slow",
            get(|| async {
                let stream = futures::stream::unfold(0u64, |n| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Some((
                        Ok::<_, std::convert::Infallible>(vec![1u8; 1024]),
                        n + 1,
                    ))
                });
                Response::new(Body::from_stream(stream))
            }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);
        let job = DownloadJob::new(
            "big.safetensors",
            format!("http://{}/slow", addr),
            "loras",
        )
        .unwrap();

        manager.start(job).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(manager.cancel("big.safetensors").await);
        manager.wait_for("big.safetensors").await;

        let status = manager.progress("big.safetensors").await.unwrap();
        assert_eq!(status.state, DownloadState::Cancelled);

        let dest = dir.path().join("loras").join("big.safetensors");
        assert!(!dest.exists());
        assert!(!dest.with_extension("safetensors.tmp").exists());
        assert!(!dir
            .path()
            .join("loras")
            .join("big.safetensors.tmp")
            .exists());

        // Task table is drained; a second cancel has nothing to cancel.
        assert!(!manager.cancel("big.safetensors").await);
    }

    #[tokio::test]
    async fn test_http_error_sets_error_status() {
        let addr = serve(Router::new().route(
            "/missing",
            get(|| async { StatusCode::NOT_FOUND }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);
        let job = DownloadJob::new(
            "gone.safetensors",
            format!("http://{}/missing", addr),
            "loras",
        )
        .unwrap();

        manager.start(job).await;
        manager.wait_for("gone.safetensors").await;

        let status = manager.progress("gone.safetensors").await.unwrap();
        assert_eq!(status.state, DownloadState::Error);
        assert!(status.error.as_deref().unwrap().contains("HTTP 404"));
        assert!(!dir
            .path()
            .join("loras")
            .join("gone.safetensors.tmp")
            .exists());
    }

    #[tokio::test]
    async fn test_fast_failure_leaves_no_task_entry() {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);

        // Nothing listens on port 1; the task reaches a terminal state
        // almost immediately, possibly before start() returns.
        let job = DownloadJob::new(
            "fast.safetensors",
            "http://127.0.0.1:1/file",
            "loras",
        )
        .unwrap();
        manager.start(job).await;

        // Once the task is done its table entry must be gone, so cancel has
        // nothing left to cancel.
        let mut cleared = false;
        for _ in 0..500 {
            if !manager.cancel("fast.safetensors").await {
                cleared = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(cleared, "task table still holds an entry after terminal state");

        let status = manager.progress("fast.safetensors").await.unwrap();
        assert!(status.state.is_terminal());
    }

    #[tokio::test]
    async fn test_restart_replaces_prior_task() {
        let body = b"final contents".to_vec();
        let payload = body.clone();
        let addr = serve(Router::new().route(
            "/file",
            get(move || {
                let payload = payload.clone();
                async move { payload }
            }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir);
        let url = format!("http://{}/file", addr);

        let job = DownloadJob::new("dup.safetensors", &url, "loras").unwrap();
        manager.start(job.clone()).await;
        manager.start(job).await;
        manager.wait_for("dup.safetensors").await;

        let status = manager.progress("dup.safetensors").await.unwrap();
        assert_eq!(status.state, DownloadState::Completed);
        let dest = dir.path().join("loras").join("dup.safetensors");
        assert_eq!(std::fs::read(dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_replaces_existing_destination_file() {
        let addr = serve(Router::new().route(
            "/file",
            get(|| async { b"new".to_vec() }),
        ))
        .await;

        let dir = TempDir::new().unwrap();
        let loras = dir.path().join("loras");
        std::fs::create_dir_all(&loras).unwrap();
        std::fs::write(loras.join("old.safetensors"), b"stale data").unwrap();

        let manager = manager_for(&dir);
        let job = DownloadJob::new(
            "old.safetensors",
            format!("http://{}/file", addr),
            "loras",
        )
        .unwrap();
        manager.start(job).await;
        manager.wait_for("old.safetensors").await;

        assert_eq!(
            std::fs::read(loras.join("old.safetensors")).unwrap(),
            b"new"
        );
    }
}
