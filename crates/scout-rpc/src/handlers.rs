//! Request handlers for the Scout HTTP boundary.

use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use scout_library::models::file_basename;
use scout_library::{Correction, CorrectionSite, DownloadJob, Workflow};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Scan a workflow document for missing models.
pub async fn handle_scan(
    State(state): State<Arc<AppState>>,
    Json(mut workflow): Json<Workflow>,
) -> impl IntoResponse {
    let result = state.service.scan(&mut workflow).await;
    Json(json!({
        "missing_models": result.missing_models,
        "not_found_models": result.not_found_models,
        "corrected_models": result.corrected_models,
        "counts": {
            "missing": result.missing_models.len(),
            "not_found": result.not_found_models.len(),
            "corrected": result.corrected_models.len(),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub model_url: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub expected_filename: Option<String>,
    #[serde(default)]
    pub actual_filename: Option<String>,
    #[serde(default)]
    pub node_id: Option<i64>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub correction_type: Option<String>,
    #[serde(default)]
    pub location_index: Option<usize>,
}

impl DownloadRequest {
    /// The graph position this download was requested for, when the client
    /// supplied one.
    fn site(&self) -> Option<CorrectionSite> {
        match self.correction_type.as_deref() {
            Some("widget") => Some(CorrectionSite::Widget(self.location_index?)),
            Some("property") => Some(CorrectionSite::Property(self.location_index?)),
            Some("metadata") => Some(CorrectionSite::Metadata),
            _ => None,
        }
    }
}

/// Start a download. Input errors come back as structured 400s; the download
/// itself runs in the background and is observed through the status routes.
pub async fn handle_download(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if request.model_name.trim().is_empty() {
        return Err(bad_request("model_name is required"));
    }
    if request.model_url.trim().is_empty() {
        return Err(bad_request("model_url is required"));
    }
    let category = match request.category.as_deref() {
        Some(c) if !c.trim().is_empty() => c.to_string(),
        _ => {
            return Err(bad_request(
                "category is required; select one for this model first",
            ))
        }
    };

    let expected = request
        .expected_filename
        .clone()
        .unwrap_or_else(|| file_basename(&request.model_name));

    let mut job = DownloadJob::new(&expected, &request.model_url, &category)
        .map_err(|e| bad_request(e.to_string()))?;
    if let Some(actual) = &request.actual_filename {
        job = job.with_actual_filename(actual);
    }

    info!("Download requested: {} ({})", expected, category);
    state.service.downloads().start(job).await;

    // When the saved filename differs from the workflow's reference, hand the
    // client the patch it should apply to the referencing node.
    let correction = request.site().and_then(|site| {
        if expected == request.model_name {
            return None;
        }
        Some(Correction {
            name: file_basename(&request.model_name),
            old_path: request.model_name.clone(),
            new_path: expected.clone(),
            category: category.clone(),
            node_id: request.node_id,
            node_type: request.node_type.clone(),
            site,
        })
    });

    Ok(Json(json!({
        "message": format!("Download started for {}", expected),
        "correction": correction,
    })))
}

/// Status of every download started during this service's lifetime.
pub async fn handle_status_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.downloads().all_progress().await)
}

/// Status of one download.
pub async fn handle_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.service.downloads().progress(&name).await {
        Some(status) => Ok(Json(json!(status))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No download tracked for {}", name)})),
        )),
    }
}

/// Progress of the current workflow scan.
pub async fn handle_scan_progress(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.service.scan_progress().await {
        Some(status) => Ok(Json(json!(status))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No scan has been run"})),
        )),
    }
}

/// Cancel an active download.
pub async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.service.downloads().cancel(&name).await;
    if !cancelled {
        warn!("Cancel requested for inactive download: {}", name);
    }
    Json(json!({"cancelled": cancelled}))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Search the remote hub for a filename.
pub async fn handle_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if query.name.trim().is_empty() {
        return Err(bad_request("name is required"));
    }
    if let Some(category) = &query.category {
        info!("Searching hub for {} (category hint: {})", query.name, category);
    }
    let results = state.service.search(&query.name).await;
    Ok(Json(json!(results)))
}

/// Sorted category keys the host has registered.
pub async fn handle_categories(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"categories": state.service.categories()}))
}
