//! Application webhook dispatcher.
//!
//! Durable webhooks are owned by an application and filtered by event and
//! queue. Every delivery is signed: `X-Webhook-Signature` carries the
//! hex HMAC-SHA256 of the exact body bytes under the webhook's secret.
//!
//! Failure bookkeeping lives on the webhook record: a failed delivery run
//! (terminal 4xx or exhausted retries) increments `failureCount`, ten
//! consecutive failures quarantine the webhook (`active = false`) until an
//! operator re-enables it, and any success resets the counter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use rand::Rng;
use reqwest::Client;
use tracing::{debug, warn};

use crate::jobs::{JobEvent, JobEventKind};
use crate::metastore::{AppWebhook, MetadataStore};

use super::{backoff_delay, retriable_status, signing, DeliveryOutcome, WebhookBody};

const USER_AGENT: &str = concat!("relayq-webhooks/", env!("CARGO_PKG_VERSION"));

/// Delivers signed application webhooks.
pub struct AppHookDispatcher {
    metastore: Arc<dyn MetadataStore>,
    client: Client,
    timeout: Duration,
    max_backoff: Duration,
}

impl AppHookDispatcher {
    /// Create a dispatcher over the metadata store.
    #[must_use]
    pub fn new(
        metastore: Arc<dyn MetadataStore>,
        timeout: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            metastore,
            client: Client::new(),
            timeout,
            max_backoff,
        }
    }

    /// Fan an event out to every matching active webhook of the owning
    /// application. Deliveries run in parallel and never surface errors to
    /// the event source.
    pub async fn dispatch(&self, event: &JobEvent) {
        if event.kind == JobEventKind::Stalled {
            return;
        }
        let hooks = match self
            .metastore
            .list_webhooks(Some(&event.job.application_id))
            .await
        {
            Ok(hooks) => hooks,
            Err(err) => {
                warn!(error = %err, "could not load webhooks for fan-out");
                return;
            }
        };

        let matching: Vec<AppWebhook> = hooks
            .into_iter()
            .filter(|hook| hook.active && hook.matches(event.kind.name(), &event.job.queue))
            .collect();
        if matching.is_empty() {
            return;
        }

        join_all(
            matching
                .iter()
                .map(|hook| self.deliver_and_record(hook, event)),
        )
        .await;
    }

    async fn deliver_and_record(&self, hook: &AppWebhook, event: &JobEvent) {
        let outcome = self.deliver(hook, event).await;
        let now = Utc::now();
        let result = if outcome.success {
            self.metastore.record_webhook_success(&hook.id, now).await
        } else {
            self.metastore.record_webhook_failure(&hook.id, now).await
        };
        match result {
            Ok(updated) if !updated.active && outcome.attempts > 0 && !outcome.success => {
                warn!(
                    webhook_id = %hook.id,
                    failure_count = updated.failure_count,
                    "webhook quarantined after sustained failures"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(webhook_id = %hook.id, error = %err, "webhook bookkeeping failed"),
        }
    }

    /// Run one delivery (all attempts) against a webhook.
    pub async fn deliver(&self, hook: &AppWebhook, event: &JobEvent) -> DeliveryOutcome {
        let body = WebhookBody::from_event(event);
        let raw = match serde_json::to_vec(&body) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(webhook_id = %hook.id, error = %err, "unserializable webhook body");
                return DeliveryOutcome {
                    success: false,
                    attempts: 0,
                    last_status: None,
                    last_error: Some(err.to_string()),
                };
            }
        };
        self.send_signed(hook, event.kind.name(), &event.job.id.to_string(), raw)
            .await
    }

    /// Send a synthetic event through a webhook; used by the test endpoint.
    pub async fn deliver_test(&self, hook: &AppWebhook) -> DeliveryOutcome {
        let raw = serde_json::to_vec(&serde_json::json!({
            "jobId": "test",
            "status": "test",
            "timestamp": Utc::now(),
        }))
        .unwrap_or_default();
        self.send_signed(hook, "test", "test", raw).await
    }

    async fn send_signed(
        &self,
        hook: &AppWebhook,
        event_name: &str,
        job_id: &str,
        raw: Vec<u8>,
    ) -> DeliveryOutcome {
        let signature = signing::sign(&hook.secret, &raw);
        let retry = &hook.retry_config;
        let max_attempts = retry.max_attempts.max(1);

        let mut outcome = DeliveryOutcome {
            success: false,
            attempts: 0,
            last_status: None,
            last_error: None,
        };

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;
            let mut request = self
                .client
                .post(&hook.url)
                .timeout(self.timeout)
                .header("Content-Type", "application/json")
                .header("User-Agent", USER_AGENT)
                .header("X-Webhook-Event", event_name)
                .header("X-Webhook-Timestamp", Utc::now().timestamp().to_string())
                .header("X-Webhook-Attempt", attempt.to_string())
                .header("X-Webhook-Signature", &signature)
                .header("X-Job-Id", job_id)
                .header("X-Job-Status", event_name);
            for (name, value) in &hook.headers {
                request = request.header(name, value);
            }

            match request.body(raw.clone()).send().await {
                Ok(res) if res.status().is_success() => {
                    outcome.success = true;
                    outcome.last_status = Some(res.status().as_u16());
                    debug!(webhook_id = %hook.id, attempt, "application webhook delivered");
                    return outcome;
                }
                Ok(res) => {
                    let code = res.status().as_u16();
                    outcome.last_status = Some(code);
                    if !retriable_status(code) {
                        warn!(webhook_id = %hook.id, code, "webhook rejected, not retrying");
                        return outcome;
                    }
                }
                Err(err) => {
                    outcome.last_error = Some(err.to_string());
                }
            }

            if attempt < max_attempts {
                let jitter: f64 = rand::thread_rng().gen();
                tokio::time::sleep(backoff_delay(
                    retry.initial_delay_ms,
                    retry.backoff_multiplier,
                    attempt,
                    jitter,
                    self.max_backoff,
                ))
                .await;
            }
        }

        warn!(
            webhook_id = %hook.id,
            attempts = outcome.attempts,
            "application webhook delivery exhausted"
        );
        outcome
    }
}
