//! Outbound webhook delivery.
//!
//! Two distinct collaborators share this module but never a code path:
//!
//! - [`job_hooks::JobHookDispatcher`] delivers the ephemeral, unsigned
//!   webhooks registered per job at submit time (5 s timeout).
//! - [`app_hooks::AppHookDispatcher`] delivers the durable, HMAC-signed
//!   application webhooks (30 s timeout, failure bookkeeping and
//!   self-quarantine).
//!
//! Both retry with exponential backoff and treat any 4xx answer as
//! terminal.

pub mod app_hooks;
pub mod job_hooks;
pub mod signing;

use std::time::Duration;

use serde::Serialize;

use crate::jobs::JobEvent;

/// Result of one delivery run (all attempts for one event).
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Whether an attempt got a success answer.
    pub success: bool,
    /// Attempts performed.
    pub attempts: u32,
    /// Status of the last response, when one arrived.
    pub last_status: Option<u16>,
    /// Transport error of the last attempt, when none arrived.
    pub last_error: Option<String>,
}

/// Wire body shared by per-job and application webhook deliveries.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBody {
    /// Job id.
    pub job_id: String,
    /// Event name (`started`, `progress`, `completed`, `failed`, …).
    pub status: String,
    /// Transition timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Progress at the time of the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Result payload, on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookBody {
    /// Build the body for a job event.
    #[must_use]
    pub fn from_event(event: &JobEvent) -> Self {
        Self {
            job_id: event.job.id.to_string(),
            status: event.kind.name().to_string(),
            timestamp: event.timestamp,
            progress: match event.kind {
                crate::jobs::JobEventKind::Progress => Some(event.job.progress),
                _ => None,
            },
            result: event.job.result.clone(),
            error: event.job.error.clone(),
        }
    }
}

/// Backoff before retry `attempt` (1-based): `initial × multiplier^(n-1)`
/// plus a jitter of up to 10 %, capped.
///
/// `jitter_frac` is a uniform sample from `[0, 1)`; passing it in keeps the
/// math testable.
#[must_use]
pub fn backoff_delay(
    initial_ms: u64,
    multiplier: f64,
    attempt: u32,
    jitter_frac: f64,
    cap: Duration,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    #[allow(clippy::cast_precision_loss)]
    let base = initial_ms as f64 * multiplier.powi(exponent as i32);
    let jittered = base + jitter_frac * 0.1 * base;
    let delay = Duration::from_millis(jittered.min(u64::MAX as f64) as u64);
    delay.min(cap)
}

/// Whether an HTTP status is worth retrying: server errors are, client
/// errors are terminal.
#[must_use]
pub fn retriable_status(status: u16) -> bool {
    status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: Duration = Duration::from_secs(60);

    #[test]
    fn test_backoff_grows_exponentially() {
        let first = backoff_delay(1_000, 2.0, 1, 0.0, CAP);
        let second = backoff_delay(1_000, 2.0, 2, 0.0, CAP);
        let third = backoff_delay(1_000, 2.0, 3, 0.0, CAP);
        assert_eq!(first, Duration::from_millis(1_000));
        assert_eq!(second, Duration::from_millis(2_000));
        assert_eq!(third, Duration::from_millis(4_000));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let bare = backoff_delay(1_000, 2.0, 3, 0.0, CAP);
        let jittered = backoff_delay(1_000, 2.0, 3, 0.999, CAP);
        assert!(jittered > bare);
        assert!(jittered <= bare.mul_f64(1.1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = backoff_delay(1_000, 2.0, 12, 0.0, CAP);
        assert_eq!(delay, CAP);
    }

    #[test]
    fn test_retriable_status_split() {
        assert!(retriable_status(500));
        assert!(retriable_status(503));
        assert!(!retriable_status(400));
        assert!(!retriable_status(404));
        assert!(!retriable_status(429));
    }

    #[test]
    fn test_body_omits_absent_fields() {
        let body = WebhookBody {
            job_id: "j1".to_string(),
            status: "started".to_string(),
            timestamp: chrono::Utc::now(),
            progress: None,
            result: None,
            error: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("progress").is_none());
        assert!(json.get("result").is_none());
        assert_eq!(json["jobId"], "j1");
    }
}
