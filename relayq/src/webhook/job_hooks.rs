//! Per-job webhook dispatcher.
//!
//! Producers may attach a `{event: url}` map when submitting a job. These
//! registrations are ephemeral (they live and die with the job), unsigned,
//! and resolved per event: the exact event name wins over the `*` entry.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use tracing::{debug, warn};

use crate::jobs::{JobEvent, JobEventKind};

use super::{backoff_delay, retriable_status, DeliveryOutcome, WebhookBody};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Delivers per-job webhooks.
pub struct JobHookDispatcher {
    client: Client,
    timeout: Duration,
    max_backoff: Duration,
}

impl JobHookDispatcher {
    /// Create a dispatcher with the configured request timeout.
    #[must_use]
    pub fn new(timeout: Duration, max_backoff: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
            max_backoff,
        }
    }

    /// Resolve the webhook URL for an event: exact match first, then `*`.
    #[must_use]
    pub fn resolve<'a>(event: &'a JobEvent) -> Option<&'a str> {
        let name = event.kind.name();
        event
            .job
            .webhooks
            .get(name)
            .or_else(|| event.job.webhooks.get("*"))
            .map(String::as_str)
    }

    /// Deliver the event to the job's registered webhook, if any.
    ///
    /// Per-job webhooks only cover worker-driven transitions; `created` and
    /// `stalled` never dispatch.
    pub async fn dispatch(&self, event: &JobEvent) -> Option<DeliveryOutcome> {
        if matches!(event.kind, JobEventKind::Created | JobEventKind::Stalled) {
            return None;
        }
        let url = Self::resolve(event)?.to_string();
        Some(self.deliver(&url, event).await)
    }

    async fn deliver(&self, url: &str, event: &JobEvent) -> DeliveryOutcome {
        let body = WebhookBody::from_event(event);
        let job_id = event.job.id.to_string();
        let status = event.kind.name();

        let mut outcome = DeliveryOutcome {
            success: false,
            attempts: 0,
            last_status: None,
            last_error: None,
        };

        for attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            outcome.attempts = attempt;
            let response = self
                .client
                .post(url)
                .timeout(self.timeout)
                .header("X-Job-Id", &job_id)
                .header("X-Job-Status", status)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(res) if res.status().is_success() => {
                    outcome.success = true;
                    outcome.last_status = Some(res.status().as_u16());
                    debug!(job_id = %job_id, %status, %url, attempt, "job webhook delivered");
                    return outcome;
                }
                Ok(res) => {
                    let code = res.status().as_u16();
                    outcome.last_status = Some(code);
                    if !retriable_status(code) {
                        warn!(job_id = %job_id, %url, code, "job webhook rejected, not retrying");
                        return outcome;
                    }
                }
                Err(err) => {
                    outcome.last_error = Some(err.to_string());
                }
            }

            if attempt < DEFAULT_MAX_ATTEMPTS {
                let jitter: f64 = rand::thread_rng().gen();
                tokio::time::sleep(backoff_delay(
                    DEFAULT_INITIAL_DELAY_MS,
                    DEFAULT_MULTIPLIER,
                    attempt,
                    jitter,
                    self.max_backoff,
                ))
                .await;
            }
        }

        warn!(
            job_id = %job_id,
            %url,
            attempts = outcome.attempts,
            "job webhook delivery exhausted"
        );
        outcome
    }
}
