use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{EngineConfig, ServerConfig};

use super::api::{self, AppState, SharedState};
use super::local::LocalProvider;
use super::provider::{HttpProvider, SandboxProvider};
use super::registry::SandboxRegistry;
use super::service::Engine;
use super::store::{DbHandle, EngineDb};

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the engine server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let engine_config =
        EngineConfig::load(std::path::Path::new(".")).context("Failed to load engine config")?;

    let provider: Arc<dyn SandboxProvider> = if config.local_mode {
        info!("Using in-process sandbox provider");
        Arc::new(LocalProvider::new())
    } else {
        let (base_url, api_key) = engine_config.require_provider_credentials()?;
        Arc::new(HttpProvider::new(base_url, api_key))
    };

    let db = EngineDb::new(&config.db_path).context("Failed to initialize engine database")?;
    let registry = SandboxRegistry::new(
        provider,
        Duration::from_secs(engine_config.idle_timeout_secs),
    );
    let engine = Engine::new(registry, DbHandle::new(db), engine_config);
    let state = Arc::new(AppState { engine });

    let mut app = build_router(state.clone());
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("atelier engine running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.engine.clear_registry();
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let provider = Arc::new(LocalProvider::new());
        let registry = SandboxRegistry::new(provider, Duration::from_secs(3600));
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let engine = Engine::new(registry, db, EngineConfig::default());
        build_router(Arc::new(AppState { engine }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "server-test"}).to_string(),
            ))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let project: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(project["name"], "server-test");
        assert_eq!(project["status"], "unprovisioned");

        let id = project["id"].as_str().unwrap();
        let req = Request::builder()
            .uri(format!("/api/projects/{}", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_project_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/projects/ghost")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_provision_unknown_project_is_404() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/projects/ghost/provision")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preview_without_sandbox_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/projects/ghost/preview")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_without_provision_is_conflict() {
        let app = test_router();

        let req = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"name": "p"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let project: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id = project["id"].as_str().unwrap();

        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/projects/{}/run", id))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"command": "echo hi"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
