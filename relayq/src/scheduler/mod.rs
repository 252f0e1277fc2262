//! Declarative schedules: recurring or one-shot HTTP calls.
//!
//! A schedule is validated on create/update, and while enabled it owns a
//! live timer in the backing store's `scheduler` queue (the opaque
//! `repeat_handle`). The promoter materializes a job per fire; the worker
//! loop claims those jobs, reloads the schedule, executes the HTTP target
//! under the schedule's retry policy and records the outcome. Reaching the
//! execution `limit` or passing `endDate` disables the schedule and cancels
//! its timer.
//!
//! Deleting cancels the timer first, then removes the record; on startup
//! every enabled schedule whose timer is missing is re-registered.

pub mod executor;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::{ApiError, ErrorCode};
use crate::jobs::{JobRecord, JobStatus, JobUpdateEntry};
use crate::metastore::{
    ExecutionStatus, MetaError, MetadataStore, RetryPolicy, Schedule, ScheduleEndpoint,
    ScheduleMethod, ScheduleTrigger,
};
use crate::shutdown::ShutdownToken;
use crate::store::{
    next_cron_occurrence, normalize_cron, BackingStore, RepeatSpec, StoreEventKind, Transition,
};

use self::executor::ExecutionReport;

/// Queue carrying materialized schedule fires.
pub const SCHEDULER_QUEUE: &str = "scheduler";

const WORKER_IDLE_WAIT: Duration = Duration::from_millis(250);

/// Endpoint section of a create/update request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Absolute target URL.
    pub url: Option<String>,
    /// HTTP method name.
    pub method: Option<String>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional JSON body.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Request timeout in seconds.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u64>,
}

/// Create request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    /// Unique name.
    pub name: Option<String>,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the schedule starts enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fire trigger.
    pub schedule: Option<ScheduleTrigger>,
    /// Target call.
    pub endpoint: Option<EndpointSpec>,
    /// Retry policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Partial update request body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleRequest {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New enabled flag.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// New trigger.
    #[serde(default)]
    pub schedule: Option<ScheduleTrigger>,
    /// New target.
    #[serde(default)]
    pub endpoint: Option<EndpointSpec>,
    /// New retry policy.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// New metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

const fn default_enabled() -> bool {
    true
}

/// Validate a trigger: exactly one of cron/at, parseable cron, future `at`,
/// recognized timezone.
pub fn validate_trigger(trigger: &ScheduleTrigger) -> Result<(), ApiError> {
    match (&trigger.cron, trigger.at) {
        (Some(_), Some(_)) => {
            return Err(ApiError::validation(
                "schedule must set exactly one of cron or at, not both",
            ));
        }
        (None, None) => {
            return Err(ApiError::validation(
                "schedule must set exactly one of cron or at",
            ));
        }
        (Some(cron), None) => {
            use std::str::FromStr as _;
            if cron::Schedule::from_str(&normalize_cron(cron)).is_err() {
                return Err(ApiError::validation(format!(
                    "invalid cron expression: {cron}"
                )));
            }
        }
        (None, Some(at)) => {
            if at <= Utc::now() {
                return Err(ApiError::validation(
                    "one-shot schedule time must be in the future",
                ));
            }
        }
    }
    if let Some(zone) = &trigger.timezone {
        if zone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ApiError::validation(format!("unknown timezone: {zone}")));
        }
    }
    Ok(())
}

/// Validate and materialize the endpoint section.
pub fn validate_endpoint(spec: &EndpointSpec) -> Result<ScheduleEndpoint, ApiError> {
    let raw_url = spec
        .url
        .as_deref()
        .ok_or_else(|| ApiError::validation("endpoint.url is required"))?;
    let parsed = url::Url::parse(raw_url)
        .map_err(|_| ApiError::validation("endpoint.url must be an absolute URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::validation("endpoint.url must be http or https"));
    }

    let method = match spec
        .method
        .as_deref()
        .map(str::to_ascii_uppercase)
        .as_deref()
    {
        None | Some("POST") => ScheduleMethod::Post,
        Some("GET") => ScheduleMethod::Get,
        Some("PUT") => ScheduleMethod::Put,
        Some("DELETE") => ScheduleMethod::Delete,
        Some("PATCH") => ScheduleMethod::Patch,
        Some(other) => {
            return Err(ApiError::validation(format!(
                "endpoint.method {other} is not one of GET, POST, PUT, DELETE, PATCH"
            )));
        }
    };

    Ok(ScheduleEndpoint {
        url: raw_url.to_string(),
        method,
        headers: spec.headers.clone(),
        body: spec.body.clone(),
        timeout_secs: spec.timeout_secs,
    })
}

/// The scheduler service.
pub struct Scheduler {
    metastore: Arc<dyn MetadataStore>,
    store: Arc<dyn BackingStore>,
    client: Client,
    shutdown: ShutdownToken,
}

impl Scheduler {
    /// Create the scheduler.
    #[must_use]
    pub fn new(
        metastore: Arc<dyn MetadataStore>,
        store: Arc<dyn BackingStore>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            metastore,
            store,
            client: Client::new(),
            shutdown,
        }
    }

    fn timer_key(schedule_id: &str) -> String {
        format!("schedule:{schedule_id}")
    }

    async fn register(
        &self,
        schedule: &Schedule,
    ) -> Result<(String, Option<chrono::DateTime<chrono::Utc>>), ApiError> {
        let spec = RepeatSpec {
            key: Self::timer_key(&schedule.id),
            cron: schedule.trigger.cron.clone(),
            timezone: schedule.trigger.timezone.clone(),
            at: schedule.trigger.at,
            end_date: schedule.trigger.end_date,
            limit: schedule.trigger.limit,
            application_id: SCHEDULER_QUEUE.to_string(),
            payload: serde_json::json!({ "scheduleId": schedule.id }),
        };
        let handle = if spec.at.is_some() {
            self.store.schedule_once(SCHEDULER_QUEUE, &spec).await?
        } else {
            self.store.schedule_repeatable(SCHEDULER_QUEUE, &spec).await?
        };
        Ok((handle, spec.next_fire(Utc::now())))
    }

    async fn load_owned(&self, auth: &AuthContext, id: &str) -> Result<Schedule, ApiError> {
        let schedule = self.metastore.schedule(id).await?;
        if auth.is_master || schedule.created_by == auth.application_id {
            Ok(schedule)
        } else {
            Err(ApiError::access_denied(format!(
                "schedule {id} belongs to another application"
            )))
        }
    }

    /// Create a schedule.
    pub async fn create(
        &self,
        auth: &AuthContext,
        req: CreateScheduleRequest,
    ) -> Result<Schedule, ApiError> {
        let name = req
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ApiError::new(ErrorCode::MissingName, "schedule name is required"))?;
        let trigger = req
            .schedule
            .ok_or_else(|| ApiError::validation("schedule section is required"))?;
        validate_trigger(&trigger)?;
        let endpoint = validate_endpoint(
            &req.endpoint
                .ok_or_else(|| ApiError::validation("endpoint section is required"))?,
        )?;

        let now = Utc::now();
        let mut schedule = Schedule {
            id: format!("sch_{}", Uuid::new_v4()),
            name: name.to_string(),
            description: req.description,
            enabled: req.enabled,
            trigger,
            endpoint,
            retry_policy: req.retry_policy.unwrap_or_default(),
            created_by: auth.application_id.clone(),
            repeat_handle: None,
            last_executed_at: None,
            last_execution_status: None,
            last_execution_error: None,
            execution_count: 0,
            next_execution_at: None,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };

        let mut created = self.metastore.create_schedule(schedule.clone()).await?;
        if schedule.enabled {
            let (handle, next) = self.register(&schedule).await?;
            created.repeat_handle = Some(handle);
            created.next_execution_at = next;
            created = self.metastore.update_schedule(created).await?;
        }
        schedule = created;
        info!(schedule_id = %schedule.id, name = %schedule.name, enabled = schedule.enabled, "schedule created");
        Ok(schedule)
    }

    /// Fetch a schedule.
    pub async fn get(&self, auth: &AuthContext, id: &str) -> Result<Schedule, ApiError> {
        self.load_owned(auth, id).await
    }

    /// List schedules visible to the caller.
    pub async fn list(&self, auth: &AuthContext) -> Result<Vec<Schedule>, ApiError> {
        let schedules = self.metastore.list_schedules().await?;
        Ok(schedules
            .into_iter()
            .filter(|s| auth.is_master || s.created_by == auth.application_id)
            .collect())
    }

    /// Update a schedule; a changed trigger re-registers the timer.
    pub async fn update(
        &self,
        auth: &AuthContext,
        id: &str,
        req: UpdateScheduleRequest,
    ) -> Result<Schedule, ApiError> {
        let mut schedule = self.load_owned(auth, id).await?;

        if let Some(name) = req.name {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::MissingName,
                    "schedule name must not be empty",
                ));
            }
            schedule.name = trimmed.to_string();
        }
        if let Some(description) = req.description {
            schedule.description = Some(description);
        }
        if let Some(trigger) = req.schedule {
            validate_trigger(&trigger)?;
            schedule.trigger = trigger;
        }
        if let Some(endpoint) = req.endpoint {
            schedule.endpoint = validate_endpoint(&endpoint)?;
        }
        if let Some(retry_policy) = req.retry_policy {
            schedule.retry_policy = retry_policy;
        }
        if let Some(metadata) = req.metadata {
            schedule.metadata = Some(metadata);
        }
        if let Some(enabled) = req.enabled {
            schedule.enabled = enabled;
        }
        schedule.updated_at = Utc::now();

        // Re-register from scratch: cancel whatever timer exists, then
        // register again when the schedule remains enabled.
        if let Some(handle) = schedule.repeat_handle.take() {
            self.store
                .cancel_repeatable(SCHEDULER_QUEUE, &handle)
                .await?;
        }
        schedule.next_execution_at = None;
        if schedule.enabled {
            let (handle, next) = self.register(&schedule).await?;
            schedule.repeat_handle = Some(handle);
            schedule.next_execution_at = next;
        }

        Ok(self.metastore.update_schedule(schedule).await?)
    }

    /// Flip a schedule's enabled flag.
    pub async fn toggle(&self, auth: &AuthContext, id: &str) -> Result<Schedule, ApiError> {
        let current = self.load_owned(auth, id).await?;
        let flipped = !current.enabled;
        self.update(
            auth,
            id,
            UpdateScheduleRequest {
                enabled: Some(flipped),
                ..UpdateScheduleRequest::default()
            },
        )
        .await
    }

    /// Delete a schedule: cancel the timer first, then drop the record.
    pub async fn delete(&self, auth: &AuthContext, id: &str) -> Result<(), ApiError> {
        let schedule = self.load_owned(auth, id).await?;
        if let Some(handle) = &schedule.repeat_handle {
            self.store
                .cancel_repeatable(SCHEDULER_QUEUE, handle)
                .await?;
        }
        self.metastore.delete_schedule(id).await?;
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    /// Execute a schedule's target now, bypassing the queue. The schedule's
    /// own retry policy still applies.
    pub async fn execute_now(
        &self,
        auth: &AuthContext,
        id: &str,
    ) -> Result<(Schedule, ExecutionReport), ApiError> {
        let schedule = self.load_owned(auth, id).await?;
        let report =
            executor::execute(&self.client, &schedule.endpoint, &schedule.retry_policy).await;
        let updated = self.apply_execution(schedule, &report).await?;
        Ok((updated, report))
    }

    async fn apply_execution(
        &self,
        mut schedule: Schedule,
        report: &ExecutionReport,
    ) -> Result<Schedule, ApiError> {
        let now = Utc::now();
        schedule.execution_count += 1;
        schedule.last_executed_at = Some(now);
        schedule.last_execution_status = Some(if report.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        });
        schedule.last_execution_error = if report.success {
            None
        } else {
            report.error.clone()
        };
        schedule.updated_at = now;

        let retire = schedule.limit_reached()
            || schedule.past_end_date(now)
            || schedule.trigger.at.is_some();
        if retire {
            if let Some(handle) = schedule.repeat_handle.take() {
                self.store
                    .cancel_repeatable(SCHEDULER_QUEUE, &handle)
                    .await?;
            }
            schedule.enabled = false;
            schedule.next_execution_at = None;
        } else if let Some(cron) = &schedule.trigger.cron {
            schedule.next_execution_at =
                next_cron_occurrence(cron, schedule.trigger.timezone.as_deref(), now);
        }

        Ok(self.metastore.update_schedule(schedule).await?)
    }

    /// Re-register enabled schedules whose timers are missing (startup).
    pub async fn reconcile(&self) -> Result<(), ApiError> {
        self.store.register_queue(SCHEDULER_QUEUE).await?;
        let live: HashSet<String> = self
            .store
            .repeat_handles(SCHEDULER_QUEUE)
            .await?
            .into_iter()
            .collect();

        for schedule in self.metastore.list_schedules().await? {
            if !schedule.enabled {
                continue;
            }
            let expected = Self::timer_key(&schedule.id);
            if live.contains(&expected) {
                continue;
            }
            match self.register(&schedule).await {
                Ok((handle, next)) => {
                    let mut refreshed = schedule;
                    refreshed.repeat_handle = Some(handle);
                    refreshed.next_execution_at = next;
                    if let Err(err) = self.metastore.update_schedule(refreshed).await {
                        warn!(error = %err, "could not persist reconciled schedule");
                    }
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "could not re-register schedule");
                }
            }
        }
        Ok(())
    }

    /// Spawn the worker loop claiming materialized fires.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            debug!("scheduler worker started");
            while !scheduler.shutdown.is_cancelled() {
                match scheduler.store.claim_next(SCHEDULER_QUEUE).await {
                    Ok(Some(job)) => scheduler.handle_fire(job).await,
                    Ok(None) => {
                        tokio::select! {
                            () = scheduler.shutdown.cancelled() => break,
                            () = tokio::time::sleep(WORKER_IDLE_WAIT) => {}
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "scheduler claim failed");
                        tokio::select! {
                            () = scheduler.shutdown.cancelled() => break,
                            () = tokio::time::sleep(WORKER_IDLE_WAIT) => {}
                        }
                    }
                }
            }
            debug!("scheduler worker stopped");
        })
    }

    async fn handle_fire(&self, job: JobRecord) {
        let Some(schedule_id) = job.data.get("scheduleId").and_then(|v| v.as_str()) else {
            warn!(job_id = %job.id, "scheduler job without scheduleId");
            self.finalize_fire(&job, false, serde_json::json!({"error": "missing scheduleId"}))
                .await;
            return;
        };
        let schedule_id = schedule_id.to_string();

        let schedule = match self.metastore.schedule(&schedule_id).await {
            Ok(schedule) => schedule,
            Err(MetaError::NotFound(_)) => {
                debug!(schedule_id = %schedule_id, "schedule deleted before fire");
                self.finalize_fire(&job, false, serde_json::json!({"error": "schedule deleted"}))
                    .await;
                return;
            }
            Err(err) => {
                warn!(schedule_id = %schedule_id, error = %err, "could not load schedule");
                self.finalize_fire(&job, false, serde_json::json!({"error": err.to_string()}))
                    .await;
                return;
            }
        };

        if !schedule.enabled {
            debug!(schedule_id = %schedule_id, "schedule disabled before fire");
            self.finalize_fire(&job, true, serde_json::json!({"skipped": "disabled"}))
                .await;
            return;
        }

        let report =
            executor::execute(&self.client, &schedule.endpoint, &schedule.retry_policy).await;
        let success = report.success;
        let summary = serde_json::json!({
            "executionId": report.execution_id,
            "success": success,
            "attempts": report.attempts,
            "status": report.status,
        });
        if let Err(err) = self.apply_execution(schedule, &report).await {
            warn!(schedule_id = %schedule_id, error = %err, "execution bookkeeping failed");
        }
        self.finalize_fire(&job, success, summary).await;
    }

    async fn finalize_fire(&self, job: &JobRecord, success: bool, summary: serde_json::Value) {
        let now = Utc::now();
        let (to, event) = if success {
            (JobStatus::Completed, StoreEventKind::Completed)
        } else {
            (JobStatus::Failed, StoreEventKind::Failed)
        };
        let transition = Transition {
            expected_from: JobStatus::Active,
            to,
            event,
            progress: None,
            result: success.then(|| summary.clone()),
            error: (!success).then(|| summary.to_string()),
            metadata: None,
            entry: JobUpdateEntry {
                status: if success { "completed" } else { "failed" }.to_string(),
                progress: None,
                result: success.then(|| summary.clone()),
                error: (!success).then(|| summary.to_string()),
                metadata: None,
                timestamp: now,
            },
            retention_ttl_secs: Some(3_600),
            timestamp: now,
        };
        if let Err(err) = self
            .store
            .apply_transition(SCHEDULER_QUEUE, job.id, &transition)
            .await
        {
            warn!(job_id = %job.id, error = %err, "could not finalize scheduler job");
        }
    }
}
