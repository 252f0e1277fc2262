//! Error taxonomy and the wire error envelope.
//!
//! Every failing endpoint responds with the same JSON envelope:
//!
//! ```json
//! {
//!   "success": false,
//!   "error": {
//!     "code": "QUEUE_ACCESS_DENIED",
//!     "message": "application app_1 may not submit to queue email",
//!     "hints": ["ask the operator to add the queue to allowedQueues"]
//!   }
//! }
//! ```
//!
//! Component-internal errors (store, metastore, delivery) are defined next
//! to the components that raise them; this module owns the mapping from
//! those errors onto HTTP status codes and stable error codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::metastore::MetaError;
use crate::store::StoreError;

/// Stable error codes exposed on the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No `x-api-key` header was provided.
    MissingApiKey,
    /// The provided api key does not resolve to an application.
    InvalidApiKey,
    /// The application is not allowed to use the requested queue.
    QueueAccessDenied,
    /// The caller lacks the privilege for an admin operation.
    PermissionDenied,
    /// The caller may not read or mutate a foreign application's resource.
    AccessDenied,
    /// A request failed structural validation.
    ValidationError,
    /// The request body is missing the required `data` payload.
    MissingData,
    /// The request is missing a required name.
    MissingName,
    /// Unknown queue.
    QueueNotFound,
    /// Unknown job.
    JobNotFound,
    /// Unknown subscription.
    SubscriptionNotFound,
    /// Unknown webhook.
    WebhookNotFound,
    /// Unknown schedule.
    ScheduleNotFound,
    /// Unknown application.
    ApplicationNotFound,
    /// Duplicate name or an invalid state transition on a terminal job.
    Conflict,
    /// Too many requests inside the rate-limit window.
    RateLimitExceeded,
    /// The Redis-compatible backing store is unreachable.
    BackingStoreUnavailable,
    /// The durable metadata store is unreachable.
    MetadataStoreUnavailable,
    /// Internal delivery failure; never surfaced to submitters.
    WebhookDeliveryFailed,
}

impl ErrorCode {
    /// Default HTTP status for this code.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::QueueAccessDenied | Self::PermissionDenied | Self::AccessDenied => {
                StatusCode::FORBIDDEN
            }
            Self::ValidationError | Self::MissingData | Self::MissingName => {
                StatusCode::BAD_REQUEST
            }
            Self::QueueNotFound
            | Self::JobNotFound
            | Self::SubscriptionNotFound
            | Self::WebhookNotFound
            | Self::ScheduleNotFound
            | Self::ApplicationNotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::BackingStoreUnavailable
            | Self::MetadataStoreUnavailable
            | Self::WebhookDeliveryFailed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// An error ready to be rendered as the wire envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional short hints for the caller.
    pub hints: Vec<String>,
    /// Optional likely causes.
    pub possible_causes: Vec<String>,
    /// Optional suggested fixes.
    pub suggested_fixes: Vec<String>,
}

impl ApiError {
    /// Create an error with a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hints: Vec::new(),
            possible_causes: Vec::new(),
            suggested_fixes: Vec::new(),
        }
    }

    /// Attach a hint for the caller.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// Attach a likely cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.possible_causes.push(cause.into());
        self
    }

    /// Attach a suggested fix.
    #[must_use]
    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fixes.push(fix.into());
        self
    }

    /// Shorthand for a `VALIDATION_ERROR`.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Shorthand for a `CONFLICT`.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Shorthand for a cross-application `ACCESS_DENIED`.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessDenied, message)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    code: ErrorCode,
    message: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    hints: &'a [String],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    possible_causes: &'a [String],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    suggested_fixes: &'a [String],
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    success: bool,
    error: ErrorBody<'a>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code,
                message: &self.message,
                hints: &self.hints,
                possible_causes: &self.possible_causes,
                suggested_fixes: &self.suggested_fixes,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::new(ErrorCode::Conflict, msg),
            StoreError::JobNotFound(id) => {
                Self::new(ErrorCode::JobNotFound, format!("job {id} not found"))
            }
            StoreError::QueueNotFound(name) => {
                Self::new(ErrorCode::QueueNotFound, format!("queue {name} not found"))
            }
            other => Self::new(ErrorCode::BackingStoreUnavailable, other.to_string())
                .with_hint("the backing store did not respond; retry shortly"),
        }
    }
}

impl From<MetaError> for ApiError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NotFound(kind) => Self::new(kind.not_found_code(), kind.to_string()),
            MetaError::Conflict(msg) => Self::new(ErrorCode::Conflict, msg),
            MetaError::Unavailable(msg) => {
                Self::new(ErrorCode::MetadataStoreUnavailable, msg)
                    .with_hint("the metadata store did not respond; retry shortly")
            }
        }
    }
}
