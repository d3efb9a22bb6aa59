use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

use super::models::{FileRecord, KillOutcome};
use super::service::Engine;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Engine,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct FileInput {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_folder: bool,
}

#[derive(Deserialize)]
pub struct SyncRequest {
    pub files: Vec<FileInput>,
}

#[derive(Deserialize)]
pub struct RunCommandRequest {
    pub command: String,
}

#[derive(Serialize)]
pub struct ProvisionResponse {
    pub sandbox_id: String,
    pub is_new: bool,
    pub restored_files: usize,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub records_written: usize,
    pub batches: usize,
    pub wrote_sandbox: bool,
}

#[derive(Serialize)]
pub struct SyncBackResponse {
    pub records_written: usize,
}

#[derive(Serialize)]
pub struct PauseResponse {
    pub outcome: &'static str,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::ProjectNotFound { .. } => ApiError::NotFound(e.to_string()),
            // Client-actionable: provision first, then retry.
            EngineError::NotProvisioned { .. } => ApiError::Conflict(e.to_string()),
            EngineError::Provisioning { .. } => ApiError::BadGateway(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/projects/{id}/provision", post(provision))
        .route("/api/projects/{id}/sync", post(sync_to_sandbox))
        .route("/api/projects/{id}/sync-back", post(sync_from_sandbox))
        .route("/api/projects/{id}/run", post(run_command))
        .route("/api/projects/{id}/files", get(list_files))
        .route("/api/projects/{id}/files/{*path}", delete(delete_file))
        .route("/api/projects/{id}/pause", post(pause))
        .route("/api/projects/{id}/preview", get(preview_root))
        .route("/api/projects/{id}/preview/{*path}", get(preview))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name must not be empty".into()));
    }
    let project = state.engine.create_project(req.name.trim()).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_projects(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state.engine.list_projects().await?;
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .engine
        .get_project(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))?;
    Ok(Json(project))
}

async fn provision(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.engine.provision(&id).await?;
    Ok(Json(ProvisionResponse {
        sandbox_id: outcome.sandbox_id,
        is_new: outcome.is_new,
        restored_files: outcome.restored_files,
    }))
}

async fn sync_to_sandbox(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let records: Vec<FileRecord> = req
        .files
        .into_iter()
        .map(|f| FileRecord {
            project_id: id.clone(),
            path: f.path,
            content: f.content,
            is_folder: f.is_folder,
            updated_at: String::new(),
        })
        .collect();
    let report = state.engine.sync_to_sandbox(&id, &records).await?;
    Ok(Json(SyncResponse {
        records_written: report.persisted.records_written,
        batches: report.persisted.batches,
        wrote_sandbox: report.restored.is_some(),
    }))
}

async fn sync_from_sandbox(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let records_written = state.engine.sync_from_sandbox(&id).await?;
    Ok(Json(SyncBackResponse { records_written }))
}

async fn run_command(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RunCommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("Command must not be empty".into()));
    }
    let output = state.engine.run_command(&id, &req.command).await?;
    Ok(Json(output))
}

async fn list_files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let files = state.engine.list_files(&id).await?;
    Ok(Json(files))
}

async fn delete_file(
    State(state): State<SharedState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.engine.delete_file(&id, &path).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("No file record at {}", path)));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn pause(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.engine.pause(&id).await?;
    Ok(Json(PauseResponse {
        outcome: match outcome {
            KillOutcome::Killed => "killed",
            KillOutcome::AlreadyGone => "already_gone",
            KillOutcome::NothingToKill => "nothing_to_kill",
        },
    }))
}

async fn preview_root(
    state: State<SharedState>,
    Path(id): Path<String>,
) -> Response {
    forward_preview(state, id, String::new()).await
}

async fn preview(
    state: State<SharedState>,
    Path((id, path)): Path<(String, String)>,
) -> Response {
    forward_preview(state, id, path).await
}

async fn forward_preview(
    State(state): State<SharedState>,
    id: String,
    path: String,
) -> Response {
    match state.engine.forward_preview(&id, &path).await {
        Ok(resp) => Response::builder()
            .status(resp.status)
            .header(header::CONTENT_TYPE, resp.content_type)
            .body(Body::from(resp.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        // "Never started" stays distinguishable from a transient upstream
        // failure: it passes through as a plain 404.
        Err(EngineError::NotProvisioned { .. }) => {
            ApiError::NotFound(format!("No sandbox provisioned for project {}", id))
                .into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
