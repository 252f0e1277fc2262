//! Outbound delivery behavior: webhook retry and quarantine, signature
//! round-trips, subscription backoff, and scheduler execution semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relayq::auth::AuthContext;
use relayq::jobs::{JobEvent, JobEventKind, JobId, JobRecord, JobStatus};
use relayq::metastore::memory::MemoryMetadataStore;
use relayq::metastore::{
    AppWebhook, MetadataStore, Subscription, SubscriptionFilters, SubscriptionRetryConfig,
    WebhookRetryConfig, WEBHOOK_QUARANTINE_THRESHOLD,
};
use relayq::scheduler::{CreateScheduleRequest, EndpointSpec, Scheduler, SCHEDULER_QUEUE};
use relayq::shutdown::ShutdownToken;
use relayq::store::BackingStore;
use relayq::subscription::SubscriptionEngine;
use relayq::testing::MemoryStore;
use relayq::webhook::app_hooks::AppHookDispatcher;
use relayq::webhook::signing;

fn job_event(kind: JobEventKind) -> JobEvent {
    JobEvent {
        kind,
        job: JobRecord {
            id: JobId::new(),
            queue: "email".to_string(),
            application_id: "app_1".to_string(),
            data: json!({"to": "a@b"}),
            metadata: HashMap::new(),
            status: JobStatus::Completed,
            progress: 100,
            result: Some(json!({"ok": true})),
            error: None,
            submitted_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            failed_at: None,
            webhooks: HashMap::new(),
            updates: Vec::new(),
        },
        timestamp: Utc::now(),
    }
}

async fn seeded_webhook(
    metastore: &MemoryMetadataStore,
    url: String,
    max_attempts: u32,
) -> AppWebhook {
    let hook = AppWebhook {
        id: "wh_1".to_string(),
        application_id: "app_1".to_string(),
        url,
        events: vec!["*".to_string()],
        queues: vec!["*".to_string()],
        headers: HashMap::new(),
        secret: "whsec_test_secret".to_string(),
        retry_config: WebhookRetryConfig {
            max_attempts,
            backoff_multiplier: 2.0,
            initial_delay_ms: 10,
        },
        active: true,
        failure_count: 0,
        last_triggered_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    metastore.create_webhook(hook.clone()).await.unwrap();
    hook
}

fn dispatcher(metastore: Arc<MemoryMetadataStore>) -> AppHookDispatcher {
    AppHookDispatcher::new(metastore, Duration::from_secs(5), Duration::from_secs(1))
}

#[tokio::test]
async fn webhook_retries_on_5xx_then_quarantines() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    seeded_webhook(&metastore, format!("{}/hook", target.uri()), 3).await;
    let dispatcher = dispatcher(metastore.clone());

    // One event: exactly three attempts against a 500 target.
    dispatcher.dispatch(&job_event(JobEventKind::Completed)).await;
    assert_eq!(target.received_requests().await.unwrap().len(), 3);
    assert_eq!(metastore.webhook("wh_1").await.unwrap().failure_count, 1);

    // Keep failing until the quarantine threshold.
    for _ in 1..WEBHOOK_QUARANTINE_THRESHOLD {
        dispatcher.dispatch(&job_event(JobEventKind::Completed)).await;
    }
    let hook = metastore.webhook("wh_1").await.unwrap();
    assert!(!hook.active, "webhook must quarantine after sustained failures");
    assert_eq!(hook.failure_count, WEBHOOK_QUARANTINE_THRESHOLD);

    // A further event produces zero attempts.
    let before = target.received_requests().await.unwrap().len();
    dispatcher.dispatch(&job_event(JobEventKind::Completed)).await;
    assert_eq!(target.received_requests().await.unwrap().len(), before);
}

#[tokio::test]
async fn webhook_4xx_is_terminal_without_retry() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    seeded_webhook(&metastore, format!("{}/hook", target.uri()), 5).await;
    let dispatcher = dispatcher(metastore.clone());

    dispatcher.dispatch(&job_event(JobEventKind::Completed)).await;
    assert_eq!(target.received_requests().await.unwrap().len(), 1);
    assert_eq!(metastore.webhook("wh_1").await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn webhook_success_resets_failures_and_signs_body() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    let hook = seeded_webhook(&metastore, format!("{}/hook", target.uri()), 3).await;
    metastore
        .record_webhook_failure("wh_1", Utc::now())
        .await
        .unwrap();
    let dispatcher = dispatcher(metastore.clone());

    dispatcher.dispatch(&job_event(JobEventKind::Completed)).await;

    let refreshed = metastore.webhook("wh_1").await.unwrap();
    assert_eq!(refreshed.failure_count, 0);
    assert!(refreshed.last_triggered_at.is_some());

    let requests = target.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request
        .headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .expect("signature header");
    assert!(signing::verify(&hook.secret, &request.body, signature));

    // Any mutation of the body invalidates the signature.
    let mut tampered = request.body.clone();
    tampered.push(b' ');
    assert!(!signing::verify(&hook.secret, &tampered, signature));
    // So does a rotated secret.
    assert!(!signing::verify("whsec_other", &request.body, signature));

    assert!(request.headers.get("X-Webhook-Timestamp").is_some());
    assert_eq!(
        request
            .headers
            .get("X-Webhook-Event")
            .and_then(|v| v.to_str().ok()),
        Some("completed")
    );
    assert_eq!(
        request
            .headers
            .get("X-Webhook-Attempt")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
}

#[tokio::test]
async fn subscription_retries_linearly_and_counts_only_success() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sink"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    metastore
        .create_subscription(Subscription {
            id: "sub_1".to_string(),
            application_id: "app_1".to_string(),
            name: "watcher".to_string(),
            endpoint: format!("{}/sink", target.uri()),
            method: relayq::metastore::DeliveryMethod::Post,
            headers: HashMap::new(),
            filters: SubscriptionFilters::default(),
            events: vec!["completed".to_string()],
            retry_config: SubscriptionRetryConfig {
                max_attempts: 3,
                backoff_ms: 10,
            },
            active: true,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let engine = SubscriptionEngine::new(metastore.clone(), Duration::from_secs(5));
    engine.dispatch(&job_event(JobEventKind::Completed)).await;

    assert_eq!(target.received_requests().await.unwrap().len(), 3);
    let sub = metastore.subscription("sub_1").await.unwrap();
    assert_eq!(sub.trigger_count, 0, "failed runs never count as triggers");
    assert_eq!(engine.failure_count(), 1);

    // Flip the target to success: one attempt, one trigger.
    target.reset().await;
    Mock::given(method("POST"))
        .and(path("/sink"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    engine.dispatch(&job_event(JobEventKind::Completed)).await;
    assert_eq!(target.received_requests().await.unwrap().len(), 1);
    let sub = metastore.subscription("sub_1").await.unwrap();
    assert_eq!(sub.trigger_count, 1);
}

fn scheduler_over(
    metastore: Arc<MemoryMetadataStore>,
    store: Arc<MemoryStore>,
) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(metastore, store, ShutdownToken::new()))
}

fn create_request(name: &str, url: String, trigger: relayq::metastore::ScheduleTrigger) -> CreateScheduleRequest {
    CreateScheduleRequest {
        name: Some(name.to_string()),
        description: None,
        enabled: true,
        schedule: Some(trigger),
        endpoint: Some(EndpointSpec {
            url: Some(url),
            method: Some("POST".to_string()),
            headers: HashMap::new(),
            body: None,
            timeout_secs: None,
        }),
        retry_policy: Some(relayq::metastore::RetryPolicy {
            attempts: 3,
            backoff: relayq::metastore::Backoff {
                kind: relayq::metastore::BackoffKind::Fixed,
                delay: 10,
            },
        }),
        metadata: None,
    }
}

#[tokio::test]
async fn schedule_client_error_is_terminal() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_over(metastore.clone(), store);

    let schedule = scheduler
        .create(
            &AuthContext::master(),
            create_request(
                "terminal",
                format!("{}/run", target.uri()),
                relayq::metastore::ScheduleTrigger {
                    cron: Some("0 0 * * *".to_string()),
                    ..relayq::metastore::ScheduleTrigger::default()
                },
            ),
        )
        .await
        .unwrap();

    let (updated, report) = scheduler
        .execute_now(&AuthContext::master(), &schedule.id)
        .await
        .unwrap();

    // Exactly one request despite attempts = 3.
    assert_eq!(target.received_requests().await.unwrap().len(), 1);
    assert!(!report.success);
    assert_eq!(
        updated.last_execution_status,
        Some(relayq::metastore::ExecutionStatus::Failed)
    );
    assert!(updated
        .last_execution_error
        .as_deref()
        .unwrap()
        .contains("400"));
    // A client error does not disable the schedule.
    assert!(updated.enabled);
}

#[tokio::test]
async fn schedule_5xx_retries_per_policy() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_over(metastore, store);

    let schedule = scheduler
        .create(
            &AuthContext::master(),
            create_request(
                "retrying",
                format!("{}/run", target.uri()),
                relayq::metastore::ScheduleTrigger {
                    cron: Some("0 0 * * *".to_string()),
                    ..relayq::metastore::ScheduleTrigger::default()
                },
            ),
        )
        .await
        .unwrap();

    let (_, report) = scheduler
        .execute_now(&AuthContext::master(), &schedule.id)
        .await
        .unwrap();
    assert_eq!(report.attempts, 3);
    assert_eq!(target.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn schedule_cron_fires_and_honors_limit() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_over(metastore.clone(), store.clone());

    let schedule = scheduler
        .create(
            &AuthContext::master(),
            create_request(
                "limited",
                format!("{}/run", target.uri()),
                relayq::metastore::ScheduleTrigger {
                    cron: Some("* * * * * *".to_string()), // every second
                    limit: Some(2),
                    ..relayq::metastore::ScheduleTrigger::default()
                },
            ),
        )
        .await
        .unwrap();

    let _worker = scheduler.spawn_worker();

    // Drive the timer forward; the worker picks fires up as they appear.
    let start = Utc::now();
    for step in 1..=6 {
        store
            .promote_due(start + chrono::Duration::seconds(step * 2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    let requests = target.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2, "limit must cap fires at two");

    let refreshed = metastore.schedule(&schedule.id).await.unwrap();
    assert_eq!(refreshed.execution_count, 2);
    assert!(!refreshed.enabled, "exhausted schedule disables itself");
    assert!(refreshed.repeat_handle.is_none());
    assert!(store
        .repeat_handles(SCHEDULER_QUEUE)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn one_shot_schedule_fires_once_and_retires() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let metastore = Arc::new(MemoryMetadataStore::new());
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler_over(metastore.clone(), store.clone());

    let schedule = scheduler
        .create(
            &AuthContext::master(),
            create_request(
                "one-shot",
                format!("{}/run", target.uri()),
                relayq::metastore::ScheduleTrigger {
                    at: Some(Utc::now() + chrono::Duration::seconds(1)),
                    ..relayq::metastore::ScheduleTrigger::default()
                },
            ),
        )
        .await
        .unwrap();
    assert!(schedule.next_execution_at.is_some());

    let _worker = scheduler.spawn_worker();
    for step in 1..=4 {
        store
            .promote_due(Utc::now() + chrono::Duration::seconds(step * 2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    assert_eq!(target.received_requests().await.unwrap().len(), 1);
    let refreshed = metastore.schedule(&schedule.id).await.unwrap();
    assert!(!refreshed.enabled);
    assert_eq!(refreshed.execution_count, 1);
}
