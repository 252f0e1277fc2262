//! Schedule endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde_json::json;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::scheduler::{CreateScheduleRequest, UpdateScheduleRequest};
use crate::state::AppState;

/// `POST /api/schedules`.
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let schedule = state.scheduler().create(&auth, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "schedule": schedule })),
    ))
}

/// `GET /api/schedules`.
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let schedules = state.scheduler().list(&auth).await?;
    Ok(Json(json!({ "success": true, "schedules": schedules })))
}

/// `GET /api/schedules/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let schedule = state.scheduler().get(&auth, &id).await?;
    Ok(Json(json!({ "success": true, "schedule": schedule })))
}

/// `PUT /api/schedules/{id}`.
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateScheduleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let schedule = state.scheduler().update(&auth, &id, body).await?;
    Ok(Json(json!({ "success": true, "schedule": schedule })))
}

/// `DELETE /api/schedules/{id}`.
pub async fn remove(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.scheduler().delete(&auth, &id).await?;
    Ok(Json(json!({ "success": true, "message": format!("schedule {id} deleted") })))
}

/// `PATCH /api/schedules/{id}/toggle`.
pub async fn toggle(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let schedule = state.scheduler().toggle(&auth, &id).await?;
    Ok(Json(json!({ "success": true, "schedule": schedule })))
}

/// `POST /api/schedules/{id}/execute` — run the target now, bypassing the
/// queue but honoring the schedule's retry policy.
pub async fn execute(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (schedule, report) = state.scheduler().execute_now(&auth, &id).await?;
    Ok(Json(json!({
        "success": report.success,
        "executionId": report.execution_id,
        "attempts": report.attempts,
        "statusCode": report.status,
        "error": report.error,
        "schedule": schedule,
    })))
}
