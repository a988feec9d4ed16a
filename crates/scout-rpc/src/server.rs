//! HTTP server implementation using Axum.

use crate::handlers;
use axum::{
    routing::{get, post},
    Router,
};
use scout_library::ScoutService;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<ScoutService>,
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    service: ScoutService,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState {
        service: Arc::new(service),
    });

    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/scout/scan", post(handlers::handle_scan))
        .route("/scout/download", post(handlers::handle_download))
        .route("/scout/status", get(handlers::handle_status_all))
        // Wildcard segments: expected filenames may contain subdirectories.
        .route("/scout/status/*name", get(handlers::handle_status))
        .route("/scout/scan-progress", get(handlers::handle_scan_progress))
        .route("/scout/cancel/*name", post(handlers::handle_cancel))
        .route("/scout/search", get(handlers::handle_search))
        .route("/scout/categories", get(handlers::handle_categories))
        .layer(cors)
        .with_state(state);

    // Parse the address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    // Bind to the address
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Server error");
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_starts() {
        let temp_dir = TempDir::new().unwrap();
        let models_root = temp_dir.path().join("models");
        std::fs::create_dir_all(&models_root).unwrap();

        let service = ScoutService::new(&models_root, temp_dir.path()).unwrap();
        let addr = start_server(service, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }
}
