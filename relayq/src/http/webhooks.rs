//! Application webhook endpoints.

use std::collections::HashMap;

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
use crate::metastore::{AppWebhook, WebhookRetryConfig, WILDCARD};
use crate::state::AppState;

const VALID_EVENTS: [&str; 6] = [
    "created",
    "started",
    "progress",
    "completed",
    "failed",
    WILDCARD,
];

fn generate_secret() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    format!("whsec_{suffix}")
}

fn validate_events(events: &[String]) -> Result<(), ApiError> {
    if events.is_empty() {
        return Err(ApiError::validation("events must not be empty"));
    }
    for event in events {
        if !VALID_EVENTS.contains(&event.as_str()) {
            return Err(ApiError::validation(format!(
                "unknown event {event}; expected created, started, progress, completed, failed or *"
            )));
        }
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<(), ApiError> {
    let parsed = url::Url::parse(raw)
        .map_err(|_| ApiError::validation("url must be an absolute URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::validation("url must be http or https"));
    }
    Ok(())
}

async fn load_owned(
    state: &AppState,
    auth: &AuthContext,
    id: &str,
) -> Result<AppWebhook, ApiError> {
    let hook = state.metastore().webhook(id).await?;
    if auth.owns(&hook.application_id) {
        Ok(hook)
    } else {
        Err(ApiError::access_denied(format!(
            "webhook {id} belongs to another application"
        )))
    }
}

/// Body of `POST /api/webhooks`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhookRequest {
    /// Delivery URL.
    pub url: String,
    /// Wanted events.
    pub events: Vec<String>,
    /// Queue filter; wildcard when absent.
    #[serde(default)]
    pub queues: Option<Vec<String>>,
    /// Extra delivery headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Retry policy.
    #[serde(default)]
    pub retry_config: Option<WebhookRetryConfig>,
}

/// `POST /api/webhooks` — register a signed webhook for the caller.
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateWebhookRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    validate_url(&body.url)?;
    validate_events(&body.events)?;

    let now = Utc::now();
    let hook = AppWebhook {
        id: format!("wh_{}", Uuid::new_v4()),
        application_id: auth.application_id.clone(),
        url: body.url,
        events: body.events,
        queues: body.queues.unwrap_or_else(|| vec![WILDCARD.to_string()]),
        headers: body.headers,
        secret: generate_secret(),
        retry_config: body.retry_config.unwrap_or_default(),
        active: true,
        failure_count: 0,
        last_triggered_at: None,
        created_at: now,
        updated_at: now,
    };
    let created = state.metastore().create_webhook(hook).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "webhook": created })),
    ))
}

/// `GET /api/webhooks` — the caller's webhooks (master: all).
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scope = (!auth.is_master).then_some(auth.application_id.as_str());
    let webhooks = state.metastore().list_webhooks(scope).await?;
    Ok(Json(json!({ "success": true, "webhooks": webhooks })))
}

/// `GET /api/webhooks/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hook = load_owned(&state, &auth, &id).await?;
    Ok(Json(json!({ "success": true, "webhook": hook })))
}

/// Body of `PATCH /api/webhooks/{id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    /// New delivery URL.
    #[serde(default)]
    pub url: Option<String>,
    /// New event set.
    #[serde(default)]
    pub events: Option<Vec<String>>,
    /// New queue filter.
    #[serde(default)]
    pub queues: Option<Vec<String>>,
    /// New delivery headers.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// New retry policy.
    #[serde(default)]
    pub retry_config: Option<WebhookRetryConfig>,
    /// Enable or disable deliveries.
    #[serde(default)]
    pub active: Option<bool>,
}

/// `PATCH /api/webhooks/{id}` — also how an operator lifts a quarantine.
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateWebhookRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut hook = load_owned(&state, &auth, &id).await?;

    if let Some(url) = body.url {
        validate_url(&url)?;
        hook.url = url;
    }
    if let Some(events) = body.events {
        validate_events(&events)?;
        hook.events = events;
    }
    if let Some(queues) = body.queues {
        hook.queues = queues;
    }
    if let Some(headers) = body.headers {
        hook.headers = headers;
    }
    if let Some(retry_config) = body.retry_config {
        hook.retry_config = retry_config;
    }
    if let Some(active) = body.active {
        hook.active = active;
        if active {
            // Re-enabling forgives the failure streak.
            hook.failure_count = 0;
        }
    }
    hook.updated_at = Utc::now();

    let updated = state.metastore().update_webhook(hook).await?;
    Ok(Json(json!({ "success": true, "webhook": updated })))
}

/// `DELETE /api/webhooks/{id}`.
pub async fn remove(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_owned(&state, &auth, &id).await?;
    state.metastore().delete_webhook(&id).await?;
    Ok(Json(json!({ "success": true, "message": format!("webhook {id} deleted") })))
}

/// `POST /api/webhooks/{id}/test` — one signed delivery attempt.
pub async fn test(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hook = load_owned(&state, &auth, &id).await?;
    let outcome = state.app_hooks().deliver_test(&hook).await;
    Ok(Json(json!({
        "success": outcome.success,
        "statusCode": outcome.last_status,
        "error": outcome.last_error,
    })))
}

/// `POST /api/webhooks/{id}/regenerate-secret` — rotate the signing secret;
/// old signatures are invalid immediately.
pub async fn regenerate_secret(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut hook = load_owned(&state, &auth, &id).await?;
    hook.secret = generate_secret();
    hook.updated_at = Utc::now();
    let updated = state.metastore().update_webhook(hook).await?;
    Ok(Json(json!({ "success": true, "secret": updated.secret })))
}
