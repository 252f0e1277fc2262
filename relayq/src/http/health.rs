//! Health endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` while the backing store answers, `degraded` otherwise.
    pub status: &'static str,
    /// Seconds since startup.
    pub uptime: u64,
    /// Backing store connectivity.
    pub redis: &'static str,
}

/// `GET /health` — liveness plus backing-store connectivity.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_up = state.store().ping().await.is_ok();
    Json(HealthResponse {
        status: if redis_up { "ok" } else { "degraded" },
        uptime: state.uptime_secs(),
        redis: if redis_up { "connected" } else { "disconnected" },
    })
}
