//! Job endpoints.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::jobs::{JobStatus, JobUpdateRequest, ListFilter, NewJob};
use crate::state::AppState;

/// `POST /api/jobs` — submit a job.
pub async fn submit(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<NewJob>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id = state.tracker().submit(&auth, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "jobId": id.to_string(),
            "message": "job accepted",
        })),
    ))
}

/// `GET /api/jobs` — list with filters.
///
/// Query: `queue`, `status`, `limit` and any number of `metadata.<key>`
/// equality pairs.
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut filter = ListFilter::default();
    for (key, value) in params {
        match key.as_str() {
            "queue" => filter.queue = Some(value),
            "status" => {
                let status: JobStatus = value
                    .parse()
                    .map_err(|err: String| ApiError::validation(err))?;
                filter.status = Some(status);
            }
            "limit" => {
                let limit: usize = value
                    .parse()
                    .map_err(|_| ApiError::validation("limit must be a positive integer"))?;
                filter.limit = Some(limit);
            }
            other => {
                if let Some(meta_key) = other.strip_prefix("metadata.") {
                    filter.metadata.insert(meta_key.to_string(), value);
                }
                // Unknown parameters are ignored.
            }
        }
    }

    let jobs = state.tracker().list(&auth, filter).await?;
    Ok(Json(json!({
        "success": true,
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

/// `GET /api/jobs/{id}` — job snapshot.
pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.tracker().get(&auth, &id).await?;
    Ok(Json(json!({ "success": true, "job": job })))
}

/// `PUT /api/jobs/{id}` — apply a lifecycle update.
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<JobUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.tracker().update(&auth, &id, body).await?;
    Ok(Json(json!({ "success": true, "job": job })))
}

/// Body of `POST /api/jobs/{id}/webhook`.
#[derive(Debug, Deserialize)]
pub struct RegisterWebhooksRequest {
    /// Event-to-URL map merged into the job's registrations.
    pub webhooks: HashMap<String, String>,
}

/// `POST /api/jobs/{id}/webhook` — register or merge per-job webhooks.
pub async fn register_webhook(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<RegisterWebhooksRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .tracker()
        .register_webhooks(&auth, &id, body.webhooks)
        .await?;
    Ok(Json(json!({ "success": true, "webhooks": job.webhooks })))
}
