//! Application registry endpoints. Every route is master-only.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::metastore::{Application, WILDCARD};
use crate::state::AppState;

use super::require_master;

fn generate_api_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("rk_{suffix}")
}

/// Body of `POST /api/applications`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApplicationRequest {
    /// Display name.
    pub name: String,
    /// Queue grants; defaults to the wildcard.
    #[serde(default)]
    pub allowed_queues: Option<Vec<String>>,
    /// Concurrency hint.
    #[serde(default)]
    pub max_concurrent_jobs: Option<u32>,
}

/// `POST /api/applications` — create a tenant and mint its api key.
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateApplicationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_master(&auth, "creating applications")?;
    if body.name.trim().is_empty() {
        return Err(ApiError::new(
            crate::error::ErrorCode::MissingName,
            "application name is required",
        ));
    }

    let now = Utc::now();
    let app = Application {
        id: format!("app_{}", Uuid::new_v4()),
        name: body.name.trim().to_string(),
        api_key: generate_api_key(),
        allowed_queues: body
            .allowed_queues
            .unwrap_or_else(|| vec![WILDCARD.to_string()]),
        max_concurrent_jobs: body.max_concurrent_jobs.unwrap_or(10),
        created_at: now,
        updated_at: now,
    };
    let created = state.metastore().create_application(app).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "application": created })),
    ))
}

/// `GET /api/applications` — list tenants.
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_master(&auth, "listing applications")?;
    let applications = state.metastore().list_applications().await?;
    Ok(Json(json!({ "success": true, "applications": applications })))
}

/// `GET /api/applications/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_master(&auth, "reading applications")?;
    let application = state.metastore().application(&id).await?;
    Ok(Json(json!({ "success": true, "application": application })))
}

/// Body of `PATCH /api/applications/{id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateApplicationRequest {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New queue grants.
    #[serde(default)]
    pub allowed_queues: Option<Vec<String>>,
    /// New concurrency hint.
    #[serde(default)]
    pub max_concurrent_jobs: Option<u32>,
}

/// `PATCH /api/applications/{id}`.
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateApplicationRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_master(&auth, "updating applications")?;
    let mut app = state.metastore().application(&id).await?;
    if let Some(name) = body.name {
        app.name = name;
    }
    if let Some(allowed_queues) = body.allowed_queues {
        app.allowed_queues = allowed_queues;
    }
    if let Some(max_concurrent_jobs) = body.max_concurrent_jobs {
        app.max_concurrent_jobs = max_concurrent_jobs;
    }
    app.updated_at = Utc::now();
    let updated = state.metastore().update_application(app).await?;
    Ok(Json(json!({ "success": true, "application": updated })))
}

/// `DELETE /api/applications/{id}`.
pub async fn remove(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_master(&auth, "deleting applications")?;
    state.metastore().delete_application(&id).await?;
    Ok(Json(json!({ "success": true, "message": format!("application {id} deleted") })))
}
