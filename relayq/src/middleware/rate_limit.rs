//! Request rate limiting.
//!
//! Fixed-window counters keyed by api key (anonymous requests share one
//! bucket). Exceeding the window answers 429 with `X-RateLimit-*` and
//! `Retry-After` headers on the standard error envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RateLimitSettings;
use crate::error::{ApiError, ErrorCode};

use super::auth::API_KEY_HEADER;

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Fixed-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitSettings,
    store: Arc<RwLock<HashMap<String, WindowEntry>>>,
}

impl RateLimiter {
    /// Create a limiter from settings.
    #[must_use]
    pub fn new(config: RateLimitSettings) -> Self {
        Self {
            config,
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    /// Count a request against `key`.
    ///
    /// Returns `Err(reset_in)` when the window is exhausted.
    pub async fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let window = self.window();

        let mut store = self.store.write().await;
        let entry = store.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= window {
            entry.count = 1;
            entry.window_start = now;
        } else {
            entry.count += 1;
        }
        let count = entry.count;
        let reset_in = window.saturating_sub(now.duration_since(entry.window_start));
        drop(store);

        if count > self.config.max_requests {
            warn!(key = %key, count, limit = self.config.max_requests, "rate limit exceeded");
            Err(reset_in)
        } else {
            Ok(())
        }
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.window();
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, entry| now.duration_since(entry.window_start) < window);
        let removed = before - store.len();
        drop(store);
        if removed > 0 {
            debug!(removed, "cleaned up expired rate limit windows");
        }
        removed
    }

    /// Middleware entry point.
    pub async fn middleware(
        State(limiter): State<Self>,
        request: Request,
        next: Next,
    ) -> Response {
        if !limiter.config.enabled {
            return next.run(request).await;
        }

        let key = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("anonymous")
            .to_string();

        match limiter.check(&key).await {
            Ok(()) => next.run(request).await,
            Err(reset_in) => limiter.reject(reset_in),
        }
    }

    fn reject(&self, reset_in: Duration) -> Response {
        let reset_secs = reset_in.as_secs().max(1);
        let mut response = ApiError::new(
            ErrorCode::RateLimitExceeded,
            format!(
                "rate limit exceeded: {} requests per {} ms",
                self.config.max_requests, self.config.window_ms
            ),
        )
        .with_hint("wait for the window to reset before retrying")
        .into_response();

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.config.max_requests.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        if let Ok(value) = HeaderValue::from_str(&reset_secs.to_string()) {
            headers.insert("X-RateLimit-Reset", value.clone());
            headers.insert("Retry-After", value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            enabled: true,
            window_ms,
            max_requests,
        })
    }

    #[tokio::test]
    async fn test_requests_within_limit_pass() {
        let limiter = limiter(3, 60_000);
        for _ in 0..3 {
            assert!(limiter.check("key-1").await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_request_over_limit_is_rejected() {
        let limiter = limiter(3, 60_000);
        for _ in 0..3 {
            limiter.check("key-1").await.unwrap();
        }
        assert!(limiter.check("key-1").await.is_err());
        // Other keys keep their own windows.
        assert!(limiter.check("key-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = limiter(1, 50);
        limiter.check("key-1").await.unwrap();
        assert!(limiter.check("key-1").await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check("key-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_removes_elapsed_windows() {
        let limiter = limiter(10, 50);
        for i in 0..4 {
            let _ = limiter.check(&format!("key-{i}")).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.cleanup_expired().await, 4);
    }

    #[tokio::test]
    async fn test_rejection_carries_rate_limit_headers() {
        let limiter = limiter(1, 60_000);
        limiter.check("k").await.unwrap();
        let reset_in = limiter.check("k").await.unwrap_err();
        let response = limiter.reject(reset_in);

        assert_eq!(response.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-RateLimit-Limit").unwrap(),
            &HeaderValue::from_static("1")
        );
        assert!(response.headers().get("X-RateLimit-Reset").is_some());
        assert!(response.headers().get("Retry-After").is_some());
    }
}
