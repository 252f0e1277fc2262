//! Durable metadata entities and the store seam.
//!
//! Applications, application webhooks, subscriptions and schedules live in
//! a durable document store. The core only depends on the [`MetadataStore`]
//! trait; the shipped [`memory::MemoryMetadataStore`] keeps everything in
//! process, and deployments with an external document store implement the
//! same trait. Writes are serialized per entity; list reads may be
//! eventually consistent.

pub mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Wildcard marker accepted in queue and event sets.
pub const WILDCARD: &str = "*";

/// Number of consecutive delivery failures after which an application
/// webhook quarantines itself.
pub const WEBHOOK_QUARANTINE_THRESHOLD: u32 = 10;

/// Entity kinds stored behind [`MetadataStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Tenant application.
    Application,
    /// Durable application webhook.
    Webhook,
    /// Event subscription.
    Subscription,
    /// Declarative schedule.
    Schedule,
}

impl EntityKind {
    /// The not-found error code for this entity kind.
    #[must_use]
    pub const fn not_found_code(self) -> ErrorCode {
        match self {
            Self::Application => ErrorCode::ApplicationNotFound,
            Self::Webhook => ErrorCode::WebhookNotFound,
            Self::Subscription => ErrorCode::SubscriptionNotFound,
            Self::Schedule => ErrorCode::ScheduleNotFound,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Application => "application not found",
            Self::Webhook => "webhook not found",
            Self::Subscription => "subscription not found",
            Self::Schedule => "schedule not found",
        };
        write!(f, "{name}")
    }
}

/// Errors raised by metadata store implementations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The requested entity does not exist.
    #[error("{0}")]
    NotFound(EntityKind),

    /// A uniqueness or state constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store is unreachable.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for metadata store operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// An isolated tenant identified by an api key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Opaque unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Credential; never logged.
    pub api_key: String,
    /// Queue names this application may use, or the wildcard `*`.
    pub allowed_queues: Vec<String>,
    /// Advisory concurrency hint.
    pub max_concurrent_jobs: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// Whether this application may use `queue`.
    #[must_use]
    pub fn allows_queue(&self, queue: &str) -> bool {
        self.allowed_queues
            .iter()
            .any(|q| q == WILDCARD || q == queue)
    }
}

/// Retry configuration for application webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookRetryConfig {
    /// Maximum delivery attempts per event.
    pub max_attempts: u32,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
        }
    }
}

/// A durable, signed webhook owned by an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWebhook {
    /// Opaque unique id.
    pub id: String,
    /// Owning application.
    pub application_id: String,
    /// Absolute delivery URL.
    pub url: String,
    /// Event names this webhook wants, or `*`.
    pub events: Vec<String>,
    /// Queue names this webhook wants, or `*`.
    pub queues: Vec<String>,
    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Signing secret. Rotating it invalidates old signatures immediately.
    pub secret: String,
    /// Retry policy.
    #[serde(default)]
    pub retry_config: WebhookRetryConfig,
    /// Whether deliveries are attempted.
    pub active: bool,
    /// Consecutive delivery failures.
    pub failure_count: u32,
    /// Last successful delivery.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl AppWebhook {
    /// Whether this webhook wants `event` on `queue`.
    #[must_use]
    pub fn matches(&self, event: &str, queue: &str) -> bool {
        let event_ok = self.events.iter().any(|e| e == WILDCARD || e == event);
        let queue_ok =
            self.queues.is_empty() || self.queues.iter().any(|q| q == WILDCARD || q == queue);
        event_ok && queue_ok
    }

    /// Record a delivery failure, quarantining after the threshold.
    pub fn register_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count >= WEBHOOK_QUARANTINE_THRESHOLD {
            self.active = false;
        }
        self.updated_at = now;
    }

    /// Record a successful delivery.
    pub fn register_success(&mut self, now: DateTime<Utc>) {
        self.failure_count = 0;
        self.last_triggered_at = Some(now);
        self.updated_at = now;
    }
}

/// Delivery method for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryMethod {
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
}

impl Default for DeliveryMethod {
    fn default() -> Self {
        Self::Post
    }
}

/// Filters narrowing which job events a subscription receives.
///
/// An absent dimension means "no restriction".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionFilters {
    /// Restrict to these queues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queues: Option<Vec<String>>,
    /// Restrict to these statuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<String>>,
    /// Require every key to be present on the job and compare equal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Retry configuration for subscription deliveries (linear backoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionRetryConfig {
    /// Maximum delivery attempts per event.
    pub max_attempts: u32,
    /// Base backoff in milliseconds; attempt `n` waits `backoff_ms × n`.
    pub backoff_ms: u64,
}

impl Default for SubscriptionRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

/// A durable fan-out rule scoped to one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Opaque unique id.
    pub id: String,
    /// Owning application.
    pub application_id: String,
    /// Display name.
    pub name: String,
    /// Absolute delivery URL.
    pub endpoint: String,
    /// Delivery method.
    #[serde(default)]
    pub method: DeliveryMethod,
    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Event filters.
    #[serde(default)]
    pub filters: SubscriptionFilters,
    /// Event names this subscription receives.
    pub events: Vec<String>,
    /// Retry policy.
    #[serde(default)]
    pub retry_config: SubscriptionRetryConfig,
    /// Whether deliveries are attempted.
    pub active: bool,
    /// Successful trigger count.
    pub trigger_count: u64,
    /// Last successful delivery.
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// HTTP methods a schedule target may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduleMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
    /// HTTP PATCH.
    Patch,
}

impl ScheduleMethod {
    /// The reqwest method for this variant.
    #[must_use]
    pub const fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
        }
    }
}

/// When a schedule fires: a cron pattern or a single future instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleTrigger {
    /// Cron pattern (five-field or with leading seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// One-shot fire time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    /// IANA timezone name for cron evaluation; UTC when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Stop firing after this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Stop after this many executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// The HTTP call a schedule performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEndpoint {
    /// Absolute target URL.
    pub url: String,
    /// HTTP method.
    pub method: ScheduleMethod,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Request timeout in seconds; 30 when unset.
    #[serde(
        default,
        rename = "timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_secs: Option<u64>,
}

/// Backoff growth for schedule retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `delay × 2^(n-1)`.
    Exponential,
    /// Constant `delay`.
    Fixed,
}

/// Backoff configuration for schedule retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Growth mode.
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: 1_000,
        }
    }
}

/// Retry policy for schedule HTTP execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts (first try included).
    pub attempts: u32,
    /// Backoff between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Outcome of the most recent schedule execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Target answered with a status below 400.
    Success,
    /// All attempts exhausted or a terminal client error.
    Failed,
}

/// A declarative record producing recurring or one-shot HTTP calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Opaque unique id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the schedule fires.
    pub enabled: bool,
    /// Fire trigger.
    #[serde(rename = "schedule")]
    pub trigger: ScheduleTrigger,
    /// Target call.
    pub endpoint: ScheduleEndpoint,
    /// Retry policy for the target call.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Application that created the schedule.
    pub created_by: String,
    /// Opaque handle of the live timer in the backing store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_handle: Option<String>,
    /// Last execution instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Last execution outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_status: Option<ExecutionStatus>,
    /// Last execution error, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_error: Option<String>,
    /// Number of completed executions.
    pub execution_count: u64,
    /// Next planned fire instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Whether the schedule has exhausted its execution budget.
    #[must_use]
    pub fn limit_reached(&self) -> bool {
        self.trigger
            .limit
            .is_some_and(|limit| self.execution_count >= limit)
    }

    /// Whether the schedule's end date has passed at `now`.
    #[must_use]
    pub fn past_end_date(&self, now: DateTime<Utc>) -> bool {
        self.trigger.end_date.is_some_and(|end| now > end)
    }
}

/// CRUD seam over the durable document store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create an application.
    async fn create_application(&self, app: Application) -> MetaResult<Application>;
    /// Fetch an application by id.
    async fn application(&self, id: &str) -> MetaResult<Application>;
    /// Resolve an application from its api key.
    async fn application_by_api_key(&self, api_key: &str) -> MetaResult<Application>;
    /// List all applications.
    async fn list_applications(&self) -> MetaResult<Vec<Application>>;
    /// Replace an application record.
    async fn update_application(&self, app: Application) -> MetaResult<Application>;
    /// Delete an application.
    async fn delete_application(&self, id: &str) -> MetaResult<()>;

    /// Create a webhook.
    async fn create_webhook(&self, webhook: AppWebhook) -> MetaResult<AppWebhook>;
    /// Fetch a webhook by id.
    async fn webhook(&self, id: &str) -> MetaResult<AppWebhook>;
    /// List webhooks, optionally restricted to one application.
    async fn list_webhooks(&self, application_id: Option<&str>) -> MetaResult<Vec<AppWebhook>>;
    /// Replace a webhook record.
    async fn update_webhook(&self, webhook: AppWebhook) -> MetaResult<AppWebhook>;
    /// Delete a webhook.
    async fn delete_webhook(&self, id: &str) -> MetaResult<()>;
    /// Record a delivery success (resets the failure count).
    async fn record_webhook_success(&self, id: &str, at: DateTime<Utc>) -> MetaResult<AppWebhook>;
    /// Record a delivery failure (quarantines past the threshold).
    async fn record_webhook_failure(&self, id: &str, at: DateTime<Utc>) -> MetaResult<AppWebhook>;

    /// Create a subscription.
    async fn create_subscription(&self, sub: Subscription) -> MetaResult<Subscription>;
    /// Fetch a subscription by id.
    async fn subscription(&self, id: &str) -> MetaResult<Subscription>;
    /// List subscriptions, optionally restricted to one application.
    async fn list_subscriptions(
        &self,
        application_id: Option<&str>,
    ) -> MetaResult<Vec<Subscription>>;
    /// Replace a subscription record.
    async fn update_subscription(&self, sub: Subscription) -> MetaResult<Subscription>;
    /// Delete a subscription.
    async fn delete_subscription(&self, id: &str) -> MetaResult<()>;
    /// Record a successful trigger.
    async fn record_subscription_trigger(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> MetaResult<Subscription>;

    /// Create a schedule; names are unique.
    async fn create_schedule(&self, schedule: Schedule) -> MetaResult<Schedule>;
    /// Fetch a schedule by id.
    async fn schedule(&self, id: &str) -> MetaResult<Schedule>;
    /// List all schedules.
    async fn list_schedules(&self) -> MetaResult<Vec<Schedule>>;
    /// Replace a schedule record; renames keep uniqueness.
    async fn update_schedule(&self, schedule: Schedule) -> MetaResult<Schedule>;
    /// Delete a schedule.
    async fn delete_schedule(&self, id: &str) -> MetaResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook() -> AppWebhook {
        AppWebhook {
            id: "wh_1".to_string(),
            application_id: "app_1".to_string(),
            url: "https://example.com/hook".to_string(),
            events: vec!["completed".to_string(), "failed".to_string()],
            queues: vec![WILDCARD.to_string()],
            headers: HashMap::new(),
            secret: "whsec_test".to_string(),
            retry_config: WebhookRetryConfig::default(),
            active: true,
            failure_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_application_queue_wildcard() {
        let app = Application {
            id: "app_1".to_string(),
            name: "test".to_string(),
            api_key: "key".to_string(),
            allowed_queues: vec![WILDCARD.to_string()],
            max_concurrent_jobs: 10,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(app.allows_queue("email"));
        assert!(app.allows_queue("anything"));
    }

    #[test]
    fn test_application_queue_membership() {
        let app = Application {
            id: "app_1".to_string(),
            name: "test".to_string(),
            api_key: "key".to_string(),
            allowed_queues: vec!["email".to_string()],
            max_concurrent_jobs: 10,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(app.allows_queue("email"));
        assert!(!app.allows_queue("reports"));
    }

    #[test]
    fn test_webhook_event_and_queue_matching() {
        let mut hook = webhook();
        assert!(hook.matches("completed", "email"));
        assert!(!hook.matches("started", "email"));

        hook.queues = vec!["email".to_string()];
        assert!(hook.matches("completed", "email"));
        assert!(!hook.matches("completed", "reports"));
    }

    #[test]
    fn test_webhook_quarantine_at_threshold() {
        let mut hook = webhook();
        let now = Utc::now();
        for _ in 0..WEBHOOK_QUARANTINE_THRESHOLD - 1 {
            hook.register_failure(now);
        }
        assert!(hook.active);
        hook.register_failure(now);
        assert!(!hook.active);
        assert_eq!(hook.failure_count, WEBHOOK_QUARANTINE_THRESHOLD);
    }

    #[test]
    fn test_webhook_success_resets_failures() {
        let mut hook = webhook();
        let now = Utc::now();
        hook.register_failure(now);
        hook.register_failure(now);
        hook.register_success(now);
        assert_eq!(hook.failure_count, 0);
        assert_eq!(hook.last_triggered_at, Some(now));
    }

    #[test]
    fn test_schedule_limit_and_end_date() {
        let now = Utc::now();
        let mut schedule = Schedule {
            id: "sch_1".to_string(),
            name: "nightly".to_string(),
            description: None,
            enabled: true,
            trigger: ScheduleTrigger {
                cron: Some("0 0 * * *".to_string()),
                limit: Some(2),
                ..ScheduleTrigger::default()
            },
            endpoint: ScheduleEndpoint {
                url: "https://example.com/run".to_string(),
                method: ScheduleMethod::Post,
                headers: HashMap::new(),
                body: None,
                timeout_secs: None,
            },
            retry_policy: RetryPolicy::default(),
            created_by: "master".to_string(),
            repeat_handle: None,
            last_executed_at: None,
            last_execution_status: None,
            last_execution_error: None,
            execution_count: 0,
            next_execution_at: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        assert!(!schedule.limit_reached());
        schedule.execution_count = 2;
        assert!(schedule.limit_reached());

        assert!(!schedule.past_end_date(now));
        schedule.trigger.end_date = Some(now - chrono::Duration::seconds(1));
        assert!(schedule.past_end_date(now));
    }

    #[test]
    fn test_entity_serialization_uses_wire_names() {
        let hook = webhook();
        let json = serde_json::to_value(&hook).unwrap();
        assert!(json.get("applicationId").is_some());
        assert!(json.get("failureCount").is_some());
        assert!(json.get("retryConfig").is_some());
    }
}
