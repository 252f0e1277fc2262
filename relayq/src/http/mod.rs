//! HTTP control plane: thin translation between requests and the core
//! services. Paths and semantics follow the public API contract; every
//! failure renders the shared error envelope.

pub mod applications;
pub mod health;
pub mod jobs;
pub mod queues;
pub mod schedules;
pub mod subscriptions;
pub mod webhooks;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::AuthContext;
use crate::error::{ApiError, ErrorCode};
use crate::middleware::{require_auth, RateLimiter};
use crate::state::AppState;

/// Build the full router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/jobs", post(jobs::submit).get(jobs::list))
        .route("/jobs/{id}", get(jobs::get).put(jobs::update))
        .route("/jobs/{id}/webhook", post(jobs::register_webhook))
        .route("/queues", get(queues::list).post(queues::create))
        .route("/queues/stats", get(queues::stats_all))
        .route("/queues/{name}/stats", get(queues::stats))
        .route("/queues/{name}/pause", post(queues::pause))
        .route("/queues/{name}/resume", post(queues::resume))
        .route("/queues/{name}/clean", post(queues::clean))
        .route(
            "/applications",
            post(applications::create).get(applications::list),
        )
        .route(
            "/applications/{id}",
            get(applications::get)
                .patch(applications::update)
                .delete(applications::remove),
        )
        .route(
            "/subscriptions",
            post(subscriptions::create).get(subscriptions::list),
        )
        .route(
            "/subscriptions/{id}",
            get(subscriptions::get)
                .put(subscriptions::update)
                .delete(subscriptions::remove),
        )
        .route("/subscriptions/{id}/test", post(subscriptions::test))
        .route("/webhooks", post(webhooks::create).get(webhooks::list))
        .route(
            "/webhooks/{id}",
            get(webhooks::get)
                .patch(webhooks::update)
                .delete(webhooks::remove),
        )
        .route("/webhooks/{id}/test", post(webhooks::test))
        .route(
            "/webhooks/{id}/regenerate-secret",
            post(webhooks::regenerate_secret),
        )
        .route(
            "/schedules",
            post(schedules::create).get(schedules::list),
        )
        .route(
            "/schedules/{id}",
            get(schedules::get)
                .put(schedules::update)
                .delete(schedules::remove),
        )
        .route("/schedules/{id}/toggle", patch(schedules::toggle))
        .route("/schedules/{id}/execute", post(schedules::execute))
        .layer(from_fn_with_state(state.auth_resolver(), require_auth))
        .layer(from_fn_with_state(
            state.rate_limiter(),
            RateLimiter::middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health::health))
        .with_state(state)
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Require master capability for an admin endpoint.
pub(crate) fn require_master(auth: &AuthContext, operation: &str) -> Result<(), ApiError> {
    if auth.is_master {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::PermissionDenied,
            format!("{operation} requires the master api key"),
        ))
    }
}
