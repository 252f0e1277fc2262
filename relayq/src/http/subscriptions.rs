//! Subscription endpoints.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::{ApiError, ErrorCode};
use crate::metastore::{
    DeliveryMethod, Subscription, SubscriptionFilters, SubscriptionRetryConfig,
};
use crate::state::AppState;

const VALID_EVENTS: [&str; 5] = ["created", "started", "progress", "completed", "failed"];

fn validate_events(events: &[String]) -> Result<(), ApiError> {
    if events.is_empty() {
        return Err(ApiError::validation("events must not be empty"));
    }
    for event in events {
        if !VALID_EVENTS.contains(&event.as_str()) {
            return Err(ApiError::validation(format!(
                "unknown event {event}; expected created, started, progress, completed or failed"
            )));
        }
    }
    Ok(())
}

fn validate_endpoint(raw: &str) -> Result<(), ApiError> {
    let parsed = url::Url::parse(raw)
        .map_err(|_| ApiError::validation("endpoint must be an absolute URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::validation("endpoint must be http or https"));
    }
    Ok(())
}

async fn load_owned(
    state: &AppState,
    auth: &AuthContext,
    id: &str,
) -> Result<Subscription, ApiError> {
    let sub = state.metastore().subscription(id).await?;
    if auth.owns(&sub.application_id) {
        Ok(sub)
    } else {
        Err(ApiError::access_denied(format!(
            "subscription {id} belongs to another application"
        )))
    }
}

/// Body of `POST /api/subscriptions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    /// Display name.
    pub name: Option<String>,
    /// Delivery URL.
    pub endpoint: Option<String>,
    /// Delivery method.
    #[serde(default)]
    pub method: DeliveryMethod,
    /// Extra delivery headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Event filters.
    #[serde(default)]
    pub filters: SubscriptionFilters,
    /// Wanted events.
    #[serde(default)]
    pub events: Vec<String>,
    /// Retry policy.
    #[serde(default)]
    pub retry_config: Option<SubscriptionRetryConfig>,
}

/// `POST /api/subscriptions` — create a fan-out rule for the caller.
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let name = body
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::MissingName, "subscription name is required"))?;
    let endpoint = body
        .endpoint
        .as_deref()
        .ok_or_else(|| ApiError::validation("endpoint is required"))?;
    validate_endpoint(endpoint)?;
    validate_events(&body.events)?;

    let now = Utc::now();
    let sub = Subscription {
        id: format!("sub_{}", Uuid::new_v4()),
        application_id: auth.application_id.clone(),
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        method: body.method,
        headers: body.headers,
        filters: body.filters,
        events: body.events,
        retry_config: body.retry_config.unwrap_or_default(),
        active: true,
        trigger_count: 0,
        last_triggered_at: None,
        created_at: now,
        updated_at: now,
    };
    let created = state.metastore().create_subscription(sub).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "subscription": created })),
    ))
}

/// `GET /api/subscriptions` — the caller's subscriptions (master: all).
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scope = (!auth.is_master).then_some(auth.application_id.as_str());
    let subscriptions = state.metastore().list_subscriptions(scope).await?;
    Ok(Json(json!({ "success": true, "subscriptions": subscriptions })))
}

/// `GET /api/subscriptions/{id}`.
pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = load_owned(&state, &auth, &id).await?;
    Ok(Json(json!({ "success": true, "subscription": sub })))
}

/// Body of `PUT /api/subscriptions/{id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscriptionRequest {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New delivery URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// New delivery method.
    #[serde(default)]
    pub method: Option<DeliveryMethod>,
    /// New delivery headers.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// New filters.
    #[serde(default)]
    pub filters: Option<SubscriptionFilters>,
    /// New event set.
    #[serde(default)]
    pub events: Option<Vec<String>>,
    /// New retry policy.
    #[serde(default)]
    pub retry_config: Option<SubscriptionRetryConfig>,
    /// Enable or disable deliveries.
    #[serde(default)]
    pub active: Option<bool>,
}

/// `PUT /api/subscriptions/{id}`.
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSubscriptionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut sub = load_owned(&state, &auth, &id).await?;

    if let Some(name) = body.name {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ApiError::new(
                ErrorCode::MissingName,
                "subscription name must not be empty",
            ));
        }
        sub.name = trimmed.to_string();
    }
    if let Some(endpoint) = body.endpoint {
        validate_endpoint(&endpoint)?;
        sub.endpoint = endpoint;
    }
    if let Some(method) = body.method {
        sub.method = method;
    }
    if let Some(headers) = body.headers {
        sub.headers = headers;
    }
    if let Some(filters) = body.filters {
        sub.filters = filters;
    }
    if let Some(events) = body.events {
        validate_events(&events)?;
        sub.events = events;
    }
    if let Some(retry_config) = body.retry_config {
        sub.retry_config = retry_config;
    }
    if let Some(active) = body.active {
        sub.active = active;
    }
    sub.updated_at = Utc::now();

    let updated = state.metastore().update_subscription(sub).await?;
    Ok(Json(json!({ "success": true, "subscription": updated })))
}

/// `DELETE /api/subscriptions/{id}`.
pub async fn remove(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_owned(&state, &auth, &id).await?;
    state.metastore().delete_subscription(&id).await?;
    Ok(Json(json!({ "success": true, "message": format!("subscription {id} deleted") })))
}

/// `POST /api/subscriptions/{id}/test` — one delivery attempt with a
/// synthetic event.
pub async fn test(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sub = load_owned(&state, &auth, &id).await?;
    let outcome = state.subscriptions().deliver_test(&sub).await;
    Ok(Json(json!({
        "success": outcome.success,
        "statusCode": outcome.last_status,
        "error": outcome.last_error,
    })))
}
