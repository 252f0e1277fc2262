//! End-to-end scenarios over the HTTP surface, backed by the in-memory
//! store implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relayq::metastore::memory::MemoryMetadataStore;
use relayq::metastore::{
    Application, MetadataStore, Subscription, SubscriptionFilters, SubscriptionRetryConfig,
};
use relayq::testing::MemoryStore;
use relayq::{http, AppState, Config};

const MASTER_KEY: &str = "master-key";

struct TestBroker {
    router: Router,
    state: AppState,
    metastore: Arc<MemoryMetadataStore>,
}

async fn broker_with(config: Config) -> TestBroker {
    let store = Arc::new(MemoryStore::new());
    let metastore = Arc::new(MemoryMetadataStore::new());

    for (id, key) in [("app_1", "key-1"), ("app_2", "key-2")] {
        metastore
            .create_application(Application {
                id: id.to_string(),
                name: id.to_string(),
                api_key: key.to_string(),
                allowed_queues: vec!["*".to_string()],
                max_concurrent_jobs: 10,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .expect("seed application");
    }

    let state = AppState::build(config, store, metastore.clone());
    TestBroker {
        router: http::router(state.clone()),
        state,
        metastore,
    }
}

async fn broker() -> TestBroker {
    let mut config = Config::default();
    config.auth.master_api_key = Some(MASTER_KEY.to_string());
    config.rate_limit.enabled = false;
    broker_with(config).await
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    api_key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("route request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn submit_complete_query_round_trip() {
    let broker = broker().await;
    let router = &broker.router;

    let (status, body) = send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({
            "queue": "email",
            "data": {"to": "a@b"},
            "metadata": {"priority": "high", "customerId": "c1"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    let job_id = body["jobId"].as_str().expect("job id").to_string();

    for update in [
        json!({"status": "started"}),
        json!({"status": "progress", "progress": 50}),
        json!({"status": "completed", "result": {"messageId": "m1"}}),
    ] {
        let (status, body) = send(
            router,
            "PUT",
            &format!("/api/jobs/{job_id}"),
            Some("key-1"),
            Some(update),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "update failed: {body}");
    }

    let (status, body) = send(
        router,
        "GET",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job = &body["job"];
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["messageId"], "m1");
    assert_eq!(job["updates"].as_array().unwrap().len(), 3);

    let started = job["startedAt"].as_str().unwrap();
    let completed = job["completedAt"].as_str().unwrap();
    assert!(started <= completed, "timestamps must be monotone");

    let (status, body) = send(
        router,
        "GET",
        "/api/jobs?metadata.priority=high&metadata.customerId=c1",
        Some("key-1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().unwrap();
    assert!(jobs.iter().any(|j| j["id"] == job_id.as_str()));
}

#[tokio::test]
async fn cross_application_isolation() {
    let broker = broker().await;
    let router = &broker.router;

    let (_, body) = send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({"queue": "email", "data": {"n": 1}})),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let (status, body) = send(
        router,
        "GET",
        &format!("/api/jobs/{job_id}"),
        Some("key-2"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "ACCESS_DENIED");

    let (status, body) = send(router, "GET", "/api/jobs", Some("key-2"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn authentication_is_enforced() {
    let broker = broker().await;
    let router = &broker.router;

    let (status, body) = send(router, "GET", "/api/jobs", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "MISSING_API_KEY");

    let (status, body) = send(router, "GET", "/api/jobs", Some("bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_API_KEY");

    // Health stays open.
    let (status, body) = send(router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["redis"], "connected");
    assert!(body.get("uptime").is_some());
}

#[tokio::test]
async fn queue_admin_requires_master() {
    let broker = broker().await;
    let router = &broker.router;

    send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({"queue": "email", "data": {}})),
    )
    .await;

    let (status, body) = send(
        router,
        "POST",
        "/api/queues/email/pause",
        Some("key-1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "PERMISSION_DENIED");

    let (status, _) = send(
        router,
        "POST",
        "/api/queues/email/pause",
        Some(MASTER_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        router,
        "GET",
        "/api/queues/email/stats",
        Some(MASTER_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["paused"], true);
    assert_eq!(body["stats"]["waiting"], 1);
}

#[tokio::test]
async fn invalid_updates_are_rejected_with_the_envelope() {
    let broker = broker().await;
    let router = &broker.router;

    let (_, body) = send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({"queue": "email", "data": {}})),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    // Progress before start.
    let (status, body) = send(
        router,
        "PUT",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        Some(json!({"status": "progress", "progress": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    // Submitting without data.
    let (status, body) = send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({"queue": "email"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "MISSING_DATA");

    // Completing twice conflicts.
    for update in [
        json!({"status": "started"}),
        json!({"status": "completed", "result": {}}),
    ] {
        send(
            router,
            "PUT",
            &format!("/api/jobs/{job_id}"),
            Some("key-1"),
            Some(update),
        )
        .await;
    }
    let (status, body) = send(
        router,
        "PUT",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        Some(json!({"status": "completed", "result": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn rate_limit_answers_429_with_headers() {
    let mut config = Config::default();
    config.auth.master_api_key = Some(MASTER_KEY.to_string());
    config.rate_limit.enabled = true;
    config.rate_limit.max_requests = 2;
    config.rate_limit.window_ms = 60_000;
    let broker = broker_with(config).await;

    for _ in 0..2 {
        let (status, _) = send(&broker.router, "GET", "/api/jobs", Some("key-1"), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let request = Request::builder()
        .method("GET")
        .uri("/api/jobs")
        .header("x-api-key", "key-1")
        .body(Body::empty())
        .unwrap();
    let response = broker.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("X-RateLimit-Limit").is_some());
    assert!(response.headers().get("Retry-After").is_some());

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn subscription_receives_matching_failure_event() {
    let broker = broker().await;
    broker.state.start_background().await;
    let router = &broker.router;

    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sink"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    broker
        .metastore
        .create_subscription(Subscription {
            id: "sub_hp".to_string(),
            application_id: "app_1".to_string(),
            name: "high-priority-failures".to_string(),
            endpoint: format!("{}/sink", target.uri()),
            method: relayq::metastore::DeliveryMethod::Post,
            headers: HashMap::new(),
            filters: SubscriptionFilters {
                queues: Some(vec!["email".to_string()]),
                statuses: None,
                metadata: Some(
                    [("priority".to_string(), json!("high"))].into_iter().collect(),
                ),
            },
            events: vec!["failed".to_string()],
            retry_config: SubscriptionRetryConfig::default(),
            active: true,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let (_, body) = send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({
            "queue": "email",
            "data": {"to": "a@b"},
            "metadata": {"priority": "high"},
        })),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    send(
        router,
        "PUT",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        Some(json!({"status": "started"})),
    )
    .await;
    send(
        router,
        "PUT",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        Some(json!({"status": "failed", "error": "x"})),
    )
    .await;

    // Delivery is asynchronous; wait for exactly one hit.
    let mut delivered = Vec::new();
    for _ in 0..50 {
        delivered = target.received_requests().await.unwrap();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(delivered.len(), 1, "expected exactly one delivery");

    let request = &delivered[0];
    assert_eq!(
        request
            .headers
            .get("X-Subscription-Id")
            .and_then(|v| v.to_str().ok()),
        Some("sub_hp")
    );
    assert_eq!(
        request
            .headers
            .get("X-Job-Status")
            .and_then(|v| v.to_str().ok()),
        Some("failed")
    );

    let payload: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(payload["job"]["status"], "failed");
    assert_eq!(payload["job"]["error"], "x");
    assert_eq!(payload["event"]["type"], "failed");

    // Exactly one delivery: give any stray retries a moment to appear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(target.received_requests().await.unwrap().len(), 1);

    let sub = broker.metastore.subscription("sub_hp").await.unwrap();
    assert_eq!(sub.trigger_count, 1);
    assert!(sub.last_triggered_at.is_some());
}

#[tokio::test]
async fn per_job_webhook_fires_on_completion() {
    let broker = broker().await;
    broker.state.start_background().await;
    let router = &broker.router;

    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/done"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let (_, body) = send(
        router,
        "POST",
        "/api/jobs",
        Some("key-1"),
        Some(json!({
            "queue": "email",
            "data": {},
            "webhooks": {"completed": format!("{}/done", target.uri())},
        })),
    )
    .await;
    let job_id = body["jobId"].as_str().unwrap().to_string();

    send(
        router,
        "PUT",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        Some(json!({"status": "started"})),
    )
    .await;
    send(
        router,
        "PUT",
        &format!("/api/jobs/{job_id}"),
        Some("key-1"),
        Some(json!({"status": "completed", "result": {"ok": true}})),
    )
    .await;

    let mut delivered = Vec::new();
    for _ in 0..50 {
        delivered = target.received_requests().await.unwrap();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(delivered.len(), 1);

    let request = &delivered[0];
    assert_eq!(
        request
            .headers
            .get("X-Job-Id")
            .and_then(|v| v.to_str().ok()),
        Some(job_id.as_str())
    );
    assert_eq!(
        request
            .headers
            .get("X-Job-Status")
            .and_then(|v| v.to_str().ok()),
        Some("completed")
    );
    let payload: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["result"]["ok"], true);
}

#[tokio::test]
async fn disabled_auth_mode_uses_default_application() {
    let mut config = Config::default();
    config.auth.enabled = false;
    config.rate_limit.enabled = false;
    let broker = broker_with(config).await;

    let (status, body) = send(
        &broker.router,
        "POST",
        "/api/jobs",
        None,
        Some(json!({"queue": "email", "data": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");

    let (status, body) = send(&broker.router, "GET", "/api/jobs", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(body["jobs"][0]["applicationId"], "default");
}
