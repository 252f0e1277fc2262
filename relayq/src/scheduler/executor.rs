//! HTTP execution of schedule targets.
//!
//! One execution runs up to `attempts` requests. Any status below 400 is a
//! terminal success; 4xx is a terminal client-error failure (never
//! retried); 5xx and transport errors retry after the policy's backoff.

use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metastore::{BackoffKind, RetryPolicy, ScheduleEndpoint};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Outcome of one execution (all attempts).
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Correlation id for this execution.
    pub execution_id: String,
    /// Whether any attempt succeeded.
    pub success: bool,
    /// Attempts performed.
    pub attempts: u32,
    /// Status of the last response, when one arrived.
    pub status: Option<u16>,
    /// Description of the final failure, when failed.
    pub error: Option<String>,
}

/// Backoff before the next attempt (`attempt` is 1-based).
#[must_use]
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.backoff.delay;
    let millis = match policy.backoff.kind {
        BackoffKind::Exponential => {
            let exponent = attempt.saturating_sub(1).min(16);
            base.saturating_mul(1_u64 << exponent)
        }
        BackoffKind::Fixed => base,
    };
    Duration::from_millis(millis)
}

/// Run a schedule's HTTP call under its retry policy.
pub async fn execute(
    client: &Client,
    endpoint: &ScheduleEndpoint,
    policy: &RetryPolicy,
) -> ExecutionReport {
    let execution_id = format!("exec_{}", Uuid::new_v4());
    let timeout = Duration::from_secs(endpoint.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let max_attempts = policy.attempts.max(1);

    let mut report = ExecutionReport {
        execution_id,
        success: false,
        attempts: 0,
        status: None,
        error: None,
    };

    for attempt in 1..=max_attempts {
        report.attempts = attempt;
        let mut request = client
            .request(endpoint.method.as_reqwest(), &endpoint.url)
            .timeout(timeout);
        for (name, value) in &endpoint.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_str(name),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                request = request.header(name, value);
            } else {
                warn!(header = %name, "skipping invalid schedule header");
            }
        }
        if let Some(body) = &endpoint.body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(res) => {
                let code = res.status().as_u16();
                report.status = Some(code);
                if code < 400 {
                    report.success = true;
                    report.error = None;
                    debug!(url = %endpoint.url, code, attempt, "schedule target answered");
                    return report;
                }
                report.error = Some(format!("target answered {code}"));
                if code < 500 {
                    // Client errors are terminal.
                    return report;
                }
            }
            Err(err) => {
                report.error = Some(err.to_string());
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(retry_delay(policy, attempt)).await;
        }
    }
    report
}
