//! Application-scoped event subscriptions.
//!
//! Subscriptions are durable fan-out rules evaluated against every job
//! transition of their owning application. A subscription matches when the
//! event name is wanted and every configured filter dimension (queues,
//! statuses, metadata equality) passes; absent dimensions are unrestricted.
//!
//! Deliveries retry on a linear backoff (`backoffMs × attempt`). Unlike
//! application webhooks, sustained failure never auto-disables a
//! subscription — the operator owns its lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::jobs::{metadata_string, JobEvent, JobEventKind, JobRecord};
use crate::metastore::{DeliveryMethod, MetadataStore, Subscription};
use crate::webhook::DeliveryOutcome;

/// Whether a subscription wants this event.
#[must_use]
pub fn matches(sub: &Subscription, event: &JobEvent) -> bool {
    if !sub.active || sub.application_id != event.job.application_id {
        return false;
    }
    let name = event.kind.name();
    if !sub.events.iter().any(|e| e == "*" || e == name) {
        return false;
    }
    if let Some(queues) = &sub.filters.queues {
        if !queues.is_empty() && !queues.iter().any(|q| q == &event.job.queue) {
            return false;
        }
    }
    if let Some(statuses) = &sub.filters.statuses {
        if !statuses.is_empty() && !statuses.iter().any(|s| s == name) {
            return false;
        }
    }
    if let Some(required) = &sub.filters.metadata {
        for (key, wanted) in required {
            let Some(actual) = event.job.metadata.get(key) else {
                return false;
            };
            // Scalars compare on string form; nested values never match.
            match (metadata_string(wanted), metadata_string(actual)) {
                (Some(a), Some(b)) if a == b => {}
                _ => return false,
            }
        }
    }
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadSubscription<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadEvent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadJob<'a> {
    id: String,
    queue: &'a str,
    status: &'a str,
    data: &'a serde_json::Value,
    metadata: &'a std::collections::HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
}

#[derive(Serialize)]
struct Payload<'a> {
    subscription: PayloadSubscription<'a>,
    event: PayloadEvent<'a>,
    job: PayloadJob<'a>,
}

fn payload<'a>(sub: &'a Subscription, event: &'a JobEvent) -> Payload<'a> {
    let job: &JobRecord = &event.job;
    Payload {
        subscription: PayloadSubscription {
            id: &sub.id,
            name: &sub.name,
        },
        event: PayloadEvent {
            kind: event.kind.name(),
            timestamp: event.timestamp,
        },
        job: PayloadJob {
            id: job.id.to_string(),
            queue: &job.queue,
            status: event.kind.name(),
            data: &job.data,
            metadata: &job.metadata,
            result: job.result.as_ref(),
            error: job.error.as_deref(),
            progress: (event.kind == JobEventKind::Progress).then_some(job.progress),
        },
    }
}

/// Evaluates filters and delivers matching events.
pub struct SubscriptionEngine {
    metastore: Arc<dyn MetadataStore>,
    client: Client,
    timeout: Duration,
    failures: AtomicU64,
}

impl SubscriptionEngine {
    /// Create an engine over the metadata store.
    #[must_use]
    pub fn new(metastore: Arc<dyn MetadataStore>, timeout: Duration) -> Self {
        Self {
            metastore,
            client: Client::new(),
            timeout,
            failures: AtomicU64::new(0),
        }
    }

    /// Total delivery runs that exhausted their attempts.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Fan an event out to every matching subscription of its application.
    pub async fn dispatch(&self, event: &JobEvent) {
        if event.kind == JobEventKind::Stalled {
            return;
        }
        let subs = match self
            .metastore
            .list_subscriptions(Some(&event.job.application_id))
            .await
        {
            Ok(subs) => subs,
            Err(err) => {
                warn!(error = %err, "could not load subscriptions for fan-out");
                return;
            }
        };

        let matching: Vec<Subscription> =
            subs.into_iter().filter(|sub| matches(sub, event)).collect();
        if matching.is_empty() {
            return;
        }

        join_all(matching.iter().map(|sub| self.deliver_and_record(sub, event))).await;
    }

    async fn deliver_and_record(&self, sub: &Subscription, event: &JobEvent) {
        let outcome = self.deliver(sub, event).await;
        if outcome.success {
            if let Err(err) = self
                .metastore
                .record_subscription_trigger(&sub.id, Utc::now())
                .await
            {
                warn!(subscription_id = %sub.id, error = %err, "trigger bookkeeping failed");
            }
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                subscription_id = %sub.id,
                attempts = outcome.attempts,
                last_status = ?outcome.last_status,
                "subscription delivery exhausted"
            );
        }
    }

    /// Run one delivery (all attempts) against a subscription.
    pub async fn deliver(&self, sub: &Subscription, event: &JobEvent) -> DeliveryOutcome {
        let body = payload(sub, event);
        let job_id = event.job.id.to_string();
        let status = event.kind.name();
        let max_attempts = sub.retry_config.max_attempts.max(1);

        let mut outcome = DeliveryOutcome {
            success: false,
            attempts: 0,
            last_status: None,
            last_error: None,
        };

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;
            let mut request = match sub.method {
                DeliveryMethod::Post => self.client.post(&sub.endpoint),
                DeliveryMethod::Put => self.client.put(&sub.endpoint),
            }
            .timeout(self.timeout)
            .header("X-Subscription-Id", &sub.id)
            .header("X-Job-Id", &job_id)
            .header("X-Job-Status", status)
            .header("X-Application-Id", &sub.application_id);
            for (name, value) in &sub.headers {
                request = request.header(name, value);
            }

            match request.json(&body).send().await {
                Ok(res) if res.status().is_success() => {
                    outcome.success = true;
                    outcome.last_status = Some(res.status().as_u16());
                    debug!(subscription_id = %sub.id, attempt, "subscription delivered");
                    return outcome;
                }
                Ok(res) => {
                    outcome.last_status = Some(res.status().as_u16());
                }
                Err(err) => {
                    outcome.last_error = Some(err.to_string());
                }
            }

            if attempt < max_attempts {
                let wait = sub.retry_config.backoff_ms.saturating_mul(u64::from(attempt));
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
        }
        outcome
    }

    /// Send a synthetic event through a subscription; used by the test
    /// endpoint. Single attempt.
    pub async fn deliver_test(&self, sub: &Subscription) -> DeliveryOutcome {
        let body = serde_json::json!({
            "subscription": {"id": sub.id, "name": sub.name},
            "event": {"type": "test", "timestamp": Utc::now()},
            "job": null,
        });
        let request = match sub.method {
            DeliveryMethod::Post => self.client.post(&sub.endpoint),
            DeliveryMethod::Put => self.client.put(&sub.endpoint),
        }
        .timeout(self.timeout)
        .header("X-Subscription-Id", &sub.id);

        match request.json(&body).send().await {
            Ok(res) => DeliveryOutcome {
                success: res.status().is_success(),
                attempts: 1,
                last_status: Some(res.status().as_u16()),
                last_error: None,
            },
            Err(err) => DeliveryOutcome {
                success: false,
                attempts: 1,
                last_status: None,
                last_error: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobStatus};
    use crate::metastore::{SubscriptionFilters, SubscriptionRetryConfig};
    use serde_json::json;
    use std::collections::HashMap;

    fn subscription(filters: SubscriptionFilters, events: &[&str]) -> Subscription {
        Subscription {
            id: "sub_1".to_string(),
            application_id: "app_1".to_string(),
            name: "watcher".to_string(),
            endpoint: "https://example.com/s".to_string(),
            method: DeliveryMethod::Post,
            headers: HashMap::new(),
            filters,
            events: events.iter().map(ToString::to_string).collect(),
            retry_config: SubscriptionRetryConfig::default(),
            active: true,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event(kind: JobEventKind, queue: &str, metadata: &[(&str, serde_json::Value)]) -> JobEvent {
        JobEvent {
            kind,
            job: JobRecord {
                id: JobId::new(),
                queue: queue.to_string(),
                application_id: "app_1".to_string(),
                data: json!({}),
                metadata: metadata
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
                status: JobStatus::Failed,
                progress: 0,
                result: None,
                error: Some("boom".to_string()),
                submitted_at: Utc::now(),
                started_at: None,
                completed_at: None,
                failed_at: None,
                webhooks: HashMap::new(),
                updates: Vec::new(),
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_name_must_be_wanted() {
        let sub = subscription(SubscriptionFilters::default(), &["failed"]);
        assert!(matches(&sub, &event(JobEventKind::Failed, "email", &[])));
        assert!(!matches(&sub, &event(JobEventKind::Completed, "email", &[])));
    }

    #[test]
    fn test_queue_filter() {
        let sub = subscription(
            SubscriptionFilters {
                queues: Some(vec!["email".to_string()]),
                ..SubscriptionFilters::default()
            },
            &["failed"],
        );
        assert!(matches(&sub, &event(JobEventKind::Failed, "email", &[])));
        assert!(!matches(&sub, &event(JobEventKind::Failed, "reports", &[])));
    }

    #[test]
    fn test_status_filter() {
        let sub = subscription(
            SubscriptionFilters {
                statuses: Some(vec!["failed".to_string()]),
                ..SubscriptionFilters::default()
            },
            &["completed", "failed"],
        );
        assert!(matches(&sub, &event(JobEventKind::Failed, "email", &[])));
        assert!(!matches(&sub, &event(JobEventKind::Completed, "email", &[])));
    }

    #[test]
    fn test_metadata_filter_requires_every_key() {
        let sub = subscription(
            SubscriptionFilters {
                metadata: Some(
                    [
                        ("priority".to_string(), json!("high")),
                        ("customerId".to_string(), json!("c1")),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..SubscriptionFilters::default()
            },
            &["failed"],
        );

        assert!(matches(
            &sub,
            &event(
                JobEventKind::Failed,
                "email",
                &[("priority", json!("high")), ("customerId", json!("c1"))]
            )
        ));
        // One key missing.
        assert!(!matches(
            &sub,
            &event(JobEventKind::Failed, "email", &[("priority", json!("high"))])
        ));
        // One key differing.
        assert!(!matches(
            &sub,
            &event(
                JobEventKind::Failed,
                "email",
                &[("priority", json!("low")), ("customerId", json!("c1"))]
            )
        ));
    }

    #[test]
    fn test_metadata_compares_on_string_form() {
        let sub = subscription(
            SubscriptionFilters {
                metadata: Some([("retries".to_string(), json!("5"))].into_iter().collect()),
                ..SubscriptionFilters::default()
            },
            &["failed"],
        );
        assert!(matches(
            &sub,
            &event(JobEventKind::Failed, "email", &[("retries", json!(5))])
        ));
    }

    #[test]
    fn test_nested_metadata_never_matches() {
        let sub = subscription(
            SubscriptionFilters {
                metadata: Some(
                    [("nested".to_string(), json!({"a": 1}))].into_iter().collect(),
                ),
                ..SubscriptionFilters::default()
            },
            &["failed"],
        );
        assert!(!matches(
            &sub,
            &event(JobEventKind::Failed, "email", &[("nested", json!({"a": 1}))])
        ));
    }

    #[test]
    fn test_inactive_and_foreign_subscriptions_never_match() {
        let mut sub = subscription(SubscriptionFilters::default(), &["failed"]);
        sub.active = false;
        assert!(!matches(&sub, &event(JobEventKind::Failed, "email", &[])));

        let mut foreign = subscription(SubscriptionFilters::default(), &["failed"]);
        foreign.application_id = "app_2".to_string();
        assert!(!matches(&foreign, &event(JobEventKind::Failed, "email", &[])));
    }

    #[test]
    fn test_payload_shape() {
        let sub = subscription(SubscriptionFilters::default(), &["failed"]);
        let event = event(JobEventKind::Failed, "email", &[("priority", json!("high"))]);
        let body = serde_json::to_value(payload(&sub, &event)).unwrap();

        assert_eq!(body["subscription"]["id"], "sub_1");
        assert_eq!(body["event"]["type"], "failed");
        assert_eq!(body["job"]["status"], "failed");
        assert_eq!(body["job"]["error"], "boom");
        assert_eq!(body["job"]["metadata"]["priority"], "high");
        assert!(body["job"].get("progress").is_none());
    }
}
