use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::error::TaskError;
use crate::manager::{TaskManager, TaskOptions};
use crate::task::{GenerationRequest, TaskRecord};

/// Caller identity, injected by the authentication layer in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Optional per-request provider key.
pub const API_KEY_HEADER: &str = "x-api-key";

const TASK_NOT_FOUND: &str = "Task not found";
const TASK_NOT_CANCELLABLE: &str = "Task not found or already completed";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    tasks: TaskManager,
}

impl AppState {
    pub fn new(tasks: TaskManager) -> Self {
        Self {
            inner: Arc::new(AppStateInner { tasks }),
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/video/generate", post(generate_video))
        .route("/api/video/generate/sync", post(generate_video_sync))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found() -> AppError {
    AppError::NotFound("API route not found".to_string())
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

fn caller_id(headers: &HeaderMap) -> Result<String, AppError> {
    header_value(headers, USER_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized("missing caller identity".to_string()))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn is_owner(state: &AppState, task_id: &str, caller: &str) -> bool {
    state.tasks().task_owner(task_id).as_deref() == Some(caller)
}

fn start_task(
    state: &AppState,
    headers: &HeaderMap,
    request: GenerationRequest,
) -> Result<String, AppError> {
    let mut options = TaskOptions::default().owner(caller_id(headers)?);
    if let Some(api_key) = header_value(headers, API_KEY_HEADER) {
        options = options.api_key(api_key);
    }
    Ok(state.tasks().create_task_with(request, options)?)
}

fn current_record(state: &AppState, task_id: &str) -> Result<TaskRecord, AppError> {
    state
        .tasks()
        .get_task_status(task_id)
        .ok_or_else(|| AppError::Internal(format!("task record missing: {task_id}")))
}

async fn generate_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<TaskRecord>), AppError> {
    let task_id = start_task(&state, &headers, request)?;
    Ok((StatusCode::CREATED, Json(current_record(&state, &task_id)?)))
}

async fn generate_video_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<TaskRecord>, AppError> {
    let task_id = start_task(&state, &headers, request)?;

    if let Some(Err(err)) = state.tasks().wait_for(&task_id).await {
        debug!(task_id = %task_id, error = %err, "synchronous generation ended without a result");
    }

    Ok(Json(current_record(&state, &task_id)?))
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TaskRecord>>, AppError> {
    let caller = caller_id(&headers)?;
    Ok(Json(state.tasks().list_tasks_for_owner(&caller)))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, AppError> {
    let caller = caller_id(&headers)?;
    if !is_owner(&state, &id, &caller) {
        return Err(AppError::NotFound(TASK_NOT_FOUND.to_string()));
    }

    state
        .tasks()
        .get_task_status(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(TASK_NOT_FOUND.to_string()))
}

async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let caller = caller_id(&headers)?;
    if !is_owner(&state, &id, &caller) || !state.tasks().cancel_task(&id) {
        return Err(AppError::NotFound(TASK_NOT_CANCELLABLE.to_string()));
    }

    Ok(Json(MessageResponse {
        message: "Task cancelled successfully".to_string(),
    }))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(_) => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}
