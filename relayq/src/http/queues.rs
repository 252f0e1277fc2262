//! Queue endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/queues` — queues visible to the caller.
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queues = state.queues().list(&auth).await?;
    Ok(Json(json!({ "success": true, "queues": queues })))
}

/// Body of `POST /api/queues`.
#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    /// Queue name to materialize.
    pub name: String,
}

/// `POST /api/queues` — materialize a queue up front.
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateQueueRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state.queues().authorize(&auth, &body.name)?;
    state.queues().materialize(&body.name).await?;
    state.pump().ensure_queue(&body.name).await;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "queue": body.name })),
    ))
}

/// `GET /api/queues/stats` — counters for every visible queue.
pub async fn stats_all(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.queues().stats_all(&auth).await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

/// `GET /api/queues/{name}/stats` — counters for one queue.
pub async fn stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = state.queues().stats(&auth, &name).await?;
    Ok(Json(json!({ "success": true, "queue": name, "stats": counts })))
}

/// `POST /api/queues/{name}/pause` — master only.
pub async fn pause(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.queues().pause(&auth, &name).await?;
    Ok(Json(json!({ "success": true, "message": format!("queue {name} paused") })))
}

/// `POST /api/queues/{name}/resume` — master only.
pub async fn resume(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.queues().resume(&auth, &name).await?;
    Ok(Json(json!({ "success": true, "message": format!("queue {name} resumed") })))
}

/// Body of `POST /api/queues/{name}/clean`.
#[derive(Debug, Default, Deserialize)]
pub struct CleanRequest {
    /// Keep terminal jobs younger than this many milliseconds.
    #[serde(default)]
    pub grace: u64,
}

/// `POST /api/queues/{name}/clean` — master only.
pub async fn clean(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
    body: Option<Json<CleanRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let grace = body.map(|Json(body)| body.grace).unwrap_or_default();
    let removed = state.queues().clean(&auth, &name, grace).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}
