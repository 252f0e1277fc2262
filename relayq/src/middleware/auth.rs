//! Api-key middleware.
//!
//! Resolves the `x-api-key` header into an [`AuthContext`] and stores it in
//! the request extensions for handlers to extract. Applied to every `/api`
//! route; `/health` stays open.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::AuthResolver;
use crate::error::ApiError;

/// Header carrying the credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Authentication middleware.
///
/// # Errors
///
/// Responds with the error envelope when the credential is missing or
/// invalid.
pub async fn require_auth(
    State(resolver): State<Arc<dyn AuthResolver>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);

    let context = resolver.resolve(api_key.as_deref()).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
