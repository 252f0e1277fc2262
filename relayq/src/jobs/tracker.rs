//! The job tracker: owns the job contract and applies lifecycle updates.
//!
//! Workers drive jobs over HTTP: `started` claims a waiting job, `progress`
//! reports while active, `completed`/`failed` finalize exactly once. Every
//! accepted update appends to the job's history and reaches the delivery
//! sinks through the store's event channel; the HTTP response never waits
//! on delivery I/O.
//!
//! Updates are serialized per job: a keyed async mutex covers the
//! read-validate-write window, and the store's compare-and-set makes the
//! final word atomic even across processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::auth::AuthContext;
use crate::config::RetentionSettings;
use crate::error::{ApiError, ErrorCode};
use crate::queue::QueueManager;
use crate::store::{BackingStore, StoreError, StoreEventKind, Transition};

use super::pump::EventPump;
use super::{metadata_string, JobId, JobRecord, JobStatus, JobUpdateEntry};

/// Default page size for job listings.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Scan window multiplier applied before metadata filtering.
const SCAN_FACTOR: usize = 4;

const VALID_HOOK_EVENTS: [&str; 5] = ["started", "progress", "completed", "failed", "*"];

/// Submission request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    /// Target queue.
    pub queue: Option<String>,
    /// Opaque payload; required.
    pub data: Option<serde_json::Value>,
    /// Filterable metadata.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Per-job webhook registrations.
    #[serde(default)]
    pub webhooks: Option<HashMap<String, String>>,
}

/// Update request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateRequest {
    /// Transition to apply (`started`, `progress`, `completed`, `failed`).
    pub status: String,
    /// Progress value for `progress` updates.
    #[serde(default)]
    pub progress: Option<u8>,
    /// Result payload for `completed`.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error message for `failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Metadata merged into the job with this update.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to one queue.
    pub queue: Option<String>,
    /// Restrict to one status.
    pub status: Option<JobStatus>,
    /// Require metadata equality on every pair (string form).
    pub metadata: HashMap<String, String>,
    /// Page size.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Started,
    Progress,
    Completed,
    Failed,
}

impl UpdateKind {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw {
            "started" => Ok(Self::Started),
            "progress" => Ok(Self::Progress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ApiError::validation(format!(
                "unknown update status {other}; expected started, progress, completed or failed"
            ))),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Process-lifetime job tracker service.
pub struct JobTracker {
    store: Arc<dyn BackingStore>,
    queues: Arc<QueueManager>,
    retention: RetentionSettings,
    locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
    pump: parking_lot::RwLock<Option<Arc<EventPump>>>,
    accepting: AtomicBool,
}

impl JobTracker {
    /// Create a tracker over the store and queue manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        queues: Arc<QueueManager>,
        retention: RetentionSettings,
    ) -> Self {
        Self {
            store,
            queues,
            retention,
            locks: Mutex::new(HashMap::new()),
            pump: parking_lot::RwLock::new(None),
            accepting: AtomicBool::new(true),
        }
    }

    /// Attach the event pump so freshly materialized queues get fan-out.
    pub fn set_pump(&self, pump: Arc<EventPump>) {
        *self.pump.write() = Some(pump);
    }

    /// Stop accepting submissions (shutdown path).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn job_lock(&self, id: JobId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(id).or_default())
    }

    fn validate_webhooks(hooks: &HashMap<String, String>) -> Result<(), ApiError> {
        for (event, url) in hooks {
            if !VALID_HOOK_EVENTS.contains(&event.as_str()) {
                return Err(ApiError::validation(format!(
                    "unknown webhook event {event}; expected one of started, progress, completed, failed, *"
                )));
            }
            if url::Url::parse(url).is_err() {
                return Err(ApiError::validation(format!(
                    "webhook url for {event} is not an absolute URL"
                )));
            }
        }
        Ok(())
    }

    /// Submit a job.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR`/`MISSING_DATA` on a malformed body,
    /// `QUEUE_ACCESS_DENIED` when the queue is outside the caller's grants.
    pub async fn submit(&self, auth: &AuthContext, new_job: NewJob) -> Result<JobId, ApiError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ApiError::new(
                ErrorCode::BackingStoreUnavailable,
                "broker is shutting down",
            ));
        }

        let queue = new_job
            .queue
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ApiError::validation("queue is required"))?;
        let Some(data) = new_job.data else {
            return Err(ApiError::new(
                ErrorCode::MissingData,
                "data is required and must be a JSON value",
            ));
        };

        self.queues.authorize(auth, queue)?;
        self.queues.materialize(queue).await?;
        let pump = self.pump.read().clone();
        if let Some(pump) = pump {
            pump.ensure_queue(queue).await;
        }

        let webhooks = new_job.webhooks.unwrap_or_default();
        Self::validate_webhooks(&webhooks)?;

        let id = JobId::new();
        let now = Utc::now();

        // Tag object payloads with their provenance.
        let data = match data {
            serde_json::Value::Object(mut map) => {
                map.insert(
                    "_applicationId".to_string(),
                    serde_json::Value::String(auth.application_id.clone()),
                );
                map.insert(
                    "_submittedAt".to_string(),
                    serde_json::Value::String(now.to_rfc3339()),
                );
                map.insert(
                    "_jobId".to_string(),
                    serde_json::Value::String(id.to_string()),
                );
                serde_json::Value::Object(map)
            }
            other => other,
        };

        let record = JobRecord {
            id,
            queue: queue.to_string(),
            application_id: auth.application_id.clone(),
            data,
            metadata: new_job.metadata.unwrap_or_default(),
            status: JobStatus::Waiting,
            progress: 0,
            result: None,
            error: None,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            webhooks,
            updates: Vec::new(),
        };

        self.store.enqueue(&record, None).await?;
        info!(job_id = %id, queue = %queue, application_id = %auth.application_id, "job submitted");
        Ok(id)
    }

    /// Apply a lifecycle update.
    pub async fn update(
        &self,
        auth: &AuthContext,
        raw_id: &str,
        update: JobUpdateRequest,
    ) -> Result<JobRecord, ApiError> {
        let id = parse_job_id(raw_id)?;
        let kind = UpdateKind::parse(&update.status)?;

        let lock = self.job_lock(id);
        let _serialized = lock.lock().await;

        let job = self
            .store
            .job(id)
            .await?
            .ok_or_else(|| job_not_found(id))?;
        if !auth.owns(&job.application_id) {
            return Err(ApiError::access_denied(format!(
                "job {id} belongs to another application"
            )));
        }

        if job.status.is_terminal() {
            return Err(ApiError::conflict(format!(
                "job {id} already finished as {}",
                job.status
            )));
        }

        let transition = self.plan_transition(&job, kind, &update)?;
        let updated = match self
            .store
            .apply_transition(&job.queue, id, &transition)
            .await
        {
            Ok(updated) => updated,
            Err(StoreError::Conflict(msg)) => return Err(ApiError::conflict(msg)),
            Err(other) => return Err(other.into()),
        };

        // Metadata added by the update joins the secondary index.
        if let Some(added) = &update.metadata {
            let pairs: Vec<(String, String)> = added
                .iter()
                .filter_map(|(k, v)| metadata_string(v).map(|s| (k.clone(), s)))
                .collect();
            self.store
                .index_metadata(&updated.application_id, id, &pairs)
                .await?;
        }

        // Terminal jobs take no further updates; their lock entry can go.
        if updated.status.is_terminal() {
            self.locks.lock().remove(&id);
        }

        Ok(updated)
    }

    fn plan_transition(
        &self,
        job: &JobRecord,
        kind: UpdateKind,
        update: &JobUpdateRequest,
    ) -> Result<Transition, ApiError> {
        let now = Utc::now();

        let (expected_from, to, event) = match kind {
            UpdateKind::Started => match job.status {
                JobStatus::Waiting => {
                    (JobStatus::Waiting, JobStatus::Active, StoreEventKind::Active)
                }
                JobStatus::Active => {
                    return Err(ApiError::conflict(format!(
                        "job {} was already claimed",
                        job.id
                    )));
                }
                _ => {
                    return Err(ApiError::validation(format!(
                        "cannot start a {} job",
                        job.status
                    )));
                }
            },
            UpdateKind::Progress => {
                if job.status != JobStatus::Active {
                    return Err(ApiError::validation(format!(
                        "cannot report progress on a {} job",
                        job.status
                    )));
                }
                (JobStatus::Active, JobStatus::Active, StoreEventKind::Progress)
            }
            UpdateKind::Completed => {
                if job.status != JobStatus::Active {
                    return Err(ApiError::validation(format!(
                        "cannot complete a {} job",
                        job.status
                    )));
                }
                (
                    JobStatus::Active,
                    JobStatus::Completed,
                    StoreEventKind::Completed,
                )
            }
            UpdateKind::Failed => {
                if job.status != JobStatus::Active {
                    return Err(ApiError::validation(format!(
                        "cannot fail a {} job",
                        job.status
                    )));
                }
                (JobStatus::Active, JobStatus::Failed, StoreEventKind::Failed)
            }
        };

        let progress = match kind {
            UpdateKind::Progress => {
                let value = update.progress.ok_or_else(|| {
                    ApiError::validation("progress updates require a progress value")
                })?;
                if value > 100 {
                    return Err(ApiError::validation("progress must be between 0 and 100"));
                }
                Some(value)
            }
            UpdateKind::Completed => Some(100),
            _ => None,
        };

        let result = match kind {
            UpdateKind::Completed => Some(update.result.clone().ok_or_else(|| {
                ApiError::validation("completed updates require a result")
            })?),
            _ => None,
        };

        let error = match kind {
            UpdateKind::Failed => Some(
                update
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| ApiError::validation("failed updates require an error"))?,
            ),
            _ => None,
        };

        let metadata = update.metadata.as_ref().map(|added| {
            let mut merged = job.metadata.clone();
            merged.extend(added.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        });

        let retention_ttl_secs = match to {
            JobStatus::Completed => Some(self.retention.completed_secs),
            JobStatus::Failed => Some(self.retention.failed_secs),
            _ => None,
        };

        Ok(Transition {
            expected_from,
            to,
            event,
            progress,
            result,
            error,
            metadata,
            entry: JobUpdateEntry {
                status: kind.name().to_string(),
                progress: update.progress,
                result: update.result.clone(),
                error: update.error.clone(),
                metadata: update.metadata.clone(),
                timestamp: now,
            },
            retention_ttl_secs,
            timestamp: now,
        })
    }

    /// Fetch a job snapshot.
    pub async fn get(&self, auth: &AuthContext, raw_id: &str) -> Result<JobRecord, ApiError> {
        let id = parse_job_id(raw_id)?;
        let job = self
            .store
            .job(id)
            .await?
            .ok_or_else(|| job_not_found(id))?;
        if !auth.owns(&job.application_id) {
            return Err(ApiError::access_denied(format!(
                "job {id} belongs to another application"
            )));
        }
        Ok(job)
    }

    /// List jobs visible to the caller.
    pub async fn list(
        &self,
        auth: &AuthContext,
        filter: ListFilter,
    ) -> Result<Vec<JobRecord>, ApiError> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);

        if let Some(queue) = &filter.queue {
            self.queues.authorize(auth, queue)?;
        }

        // The metadata index answers application-scoped lookups directly.
        if !filter.metadata.is_empty() && !auth.is_master {
            return self.list_via_index(auth, &filter, limit).await;
        }

        let queues = match &filter.queue {
            Some(queue) => vec![queue.clone()],
            None => self.queues.list(auth).await?,
        };
        let statuses: Vec<JobStatus> = match filter.status {
            Some(status) => vec![status],
            None => vec![
                JobStatus::Waiting,
                JobStatus::Active,
                JobStatus::Completed,
                JobStatus::Failed,
            ],
        };

        let scan_cap = limit.saturating_mul(SCAN_FACTOR);
        let mut results = Vec::new();
        'scan: for status in statuses {
            for queue in &queues {
                let batch = self.store.jobs_in(queue, status, scan_cap).await?;
                for job in batch {
                    if !auth.owns(&job.application_id) {
                        continue;
                    }
                    if !metadata_matches(&job, &filter.metadata) {
                        continue;
                    }
                    results.push(job);
                    if results.len() >= limit {
                        break 'scan;
                    }
                }
            }
        }
        Ok(results)
    }

    async fn list_via_index(
        &self,
        auth: &AuthContext,
        filter: &ListFilter,
        limit: usize,
    ) -> Result<Vec<JobRecord>, ApiError> {
        let mut candidate_ids: Option<Vec<JobId>> = None;
        for (key, value) in &filter.metadata {
            let ids = self
                .store
                .ids_by_metadata(&auth.application_id, key, value)
                .await?;
            candidate_ids = Some(match candidate_ids {
                None => ids,
                Some(previous) => previous.into_iter().filter(|id| ids.contains(id)).collect(),
            });
            if candidate_ids.as_ref().is_some_and(Vec::is_empty) {
                return Ok(Vec::new());
            }
        }

        let mut jobs = Vec::new();
        for id in candidate_ids.unwrap_or_default() {
            let Some(job) = self.store.job(id).await? else {
                continue; // purged job still in the index
            };
            if !auth.owns(&job.application_id) {
                continue;
            }
            if filter.queue.as_deref().is_some_and(|q| q != job.queue) {
                continue;
            }
            if filter.status.is_some_and(|s| s != job.status) {
                continue;
            }
            if !metadata_matches(&job, &filter.metadata) {
                continue;
            }
            jobs.push(job);
        }
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Merge per-job webhooks into an existing job.
    pub async fn register_webhooks(
        &self,
        auth: &AuthContext,
        raw_id: &str,
        hooks: HashMap<String, String>,
    ) -> Result<JobRecord, ApiError> {
        let id = parse_job_id(raw_id)?;
        Self::validate_webhooks(&hooks)?;

        let lock = self.job_lock(id);
        let _serialized = lock.lock().await;

        let job = self
            .store
            .job(id)
            .await?
            .ok_or_else(|| job_not_found(id))?;
        if !auth.owns(&job.application_id) {
            return Err(ApiError::access_denied(format!(
                "job {id} belongs to another application"
            )));
        }
        Ok(self.store.merge_webhooks(id, &hooks).await?)
    }

}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::new(ErrorCode::JobNotFound, format!("job {raw} not found"))
    })
}

fn job_not_found(id: JobId) -> ApiError {
    ApiError::new(ErrorCode::JobNotFound, format!("job {id} not found"))
}

fn metadata_matches(job: &JobRecord, required: &HashMap<String, String>) -> bool {
    required.iter().all(|(key, wanted)| {
        job.metadata
            .get(key)
            .and_then(metadata_string)
            .is_some_and(|actual| actual == *wanted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use serde_json::json;

    fn tracker() -> JobTracker {
        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
        let queues = Arc::new(QueueManager::new(Arc::clone(&store)));
        JobTracker::new(store, queues, RetentionSettings::default())
    }

    fn auth(app: &str, queues: &[&str]) -> AuthContext {
        AuthContext {
            application_id: app.to_string(),
            allowed_queues: queues.iter().map(ToString::to_string).collect(),
            is_master: false,
        }
    }

    fn new_job(queue: &str, metadata: &[(&str, serde_json::Value)]) -> NewJob {
        NewJob {
            queue: Some(queue.to_string()),
            data: Some(json!({"to": "a@b"})),
            metadata: Some(
                metadata
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
            ),
            webhooks: None,
        }
    }

    fn update(status: &str) -> JobUpdateRequest {
        JobUpdateRequest {
            status: status.to_string(),
            progress: None,
            result: None,
            error: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_submit_complete_query_flow() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker
            .submit(
                &auth,
                new_job("email", &[("priority", json!("high")), ("customerId", json!("c1"))]),
            )
            .await
            .unwrap();

        tracker
            .update(&auth, &id.to_string(), update("started"))
            .await
            .unwrap();
        tracker
            .update(
                &auth,
                &id.to_string(),
                JobUpdateRequest {
                    progress: Some(50),
                    ..update("progress")
                },
            )
            .await
            .unwrap();
        let job = tracker
            .update(
                &auth,
                &id.to_string(),
                JobUpdateRequest {
                    result: Some(json!({"messageId": "m1"})),
                    ..update("completed")
                },
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"messageId": "m1"})));
        assert_eq!(job.progress, 100);
        assert_eq!(job.updates.len(), 3);
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());

        let listed = tracker
            .list(
                &auth,
                ListFilter {
                    metadata: [
                        ("priority".to_string(), "high".to_string()),
                        ("customerId".to_string(), "c1".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                    ..ListFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }

    #[tokio::test]
    async fn test_submit_requires_queue_and_data() {
        let tracker = tracker();
        let auth = auth("app_1", &["*"]);

        let err = tracker
            .submit(
                &auth,
                NewJob {
                    queue: None,
                    data: Some(json!({})),
                    metadata: None,
                    webhooks: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let err = tracker
            .submit(
                &auth,
                NewJob {
                    queue: Some("email".to_string()),
                    data: None,
                    metadata: None,
                    webhooks: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingData);
    }

    #[tokio::test]
    async fn test_submit_denied_outside_grants() {
        let tracker = tracker();
        let err = tracker
            .submit(&auth("app_1", &["email"]), new_job("reports", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::QueueAccessDenied);
    }

    #[tokio::test]
    async fn test_payload_is_tagged_with_provenance() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        let job = tracker.get(&auth, &id.to_string()).await.unwrap();

        assert_eq!(job.data["_applicationId"], "app_1");
        assert_eq!(job.data["_jobId"], id.to_string());
        assert!(job.data.get("_submittedAt").is_some());
    }

    #[tokio::test]
    async fn test_terminal_jobs_reject_further_updates() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        let id = id.to_string();

        tracker.update(&auth, &id, update("started")).await.unwrap();
        tracker
            .update(
                &auth,
                &id,
                JobUpdateRequest {
                    result: Some(json!("ok")),
                    ..update("completed")
                },
            )
            .await
            .unwrap();

        for raw in ["progress", "completed", "failed", "started"] {
            let err = tracker
                .update(
                    &auth,
                    &id,
                    JobUpdateRequest {
                        progress: Some(10),
                        result: Some(json!("again")),
                        error: Some("late".to_string()),
                        ..update(raw)
                    },
                )
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::Conflict, "update {raw} after terminal");
        }
    }

    #[tokio::test]
    async fn test_started_on_claimed_job_conflicts() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        let id = id.to_string();

        tracker.update(&auth, &id, update("started")).await.unwrap();
        let err = tracker.update(&auth, &id, update("started")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_progress_requires_bounds_and_active() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        let id = id.to_string();

        // Not started yet.
        let err = tracker
            .update(
                &auth,
                &id,
                JobUpdateRequest {
                    progress: Some(10),
                    ..update("progress")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        tracker.update(&auth, &id, update("started")).await.unwrap();

        let err = tracker
            .update(
                &auth,
                &id,
                JobUpdateRequest {
                    progress: Some(101),
                    ..update("progress")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let err = tracker.update(&auth, &id, update("progress")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        // Repeated identical progress both append history entries.
        for _ in 0..2 {
            tracker
                .update(
                    &auth,
                    &id,
                    JobUpdateRequest {
                        progress: Some(50),
                        ..update("progress")
                    },
                )
                .await
                .unwrap();
        }
        let job = tracker.get(&auth, &id).await.unwrap();
        assert_eq!(job.updates.len(), 3);
    }

    #[tokio::test]
    async fn test_completed_requires_result_and_failed_requires_error() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        let id = id.to_string();
        tracker.update(&auth, &id, update("started")).await.unwrap();

        let err = tracker.update(&auth, &id, update("completed")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let err = tracker.update(&auth, &id, update("failed")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let job = tracker
            .update(
                &auth,
                &id,
                JobUpdateRequest {
                    error: Some("smtp timeout".to_string()),
                    ..update("failed")
                },
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("smtp timeout"));
        assert!(job.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_cross_application_isolation() {
        let tracker = tracker();
        let owner = auth("app_1", &["email"]);
        let other = auth("app_2", &["email"]);
        let id = tracker.submit(&owner, new_job("email", &[])).await.unwrap();
        let id = id.to_string();

        let err = tracker.get(&other, &id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AccessDenied);

        let err = tracker.update(&other, &id, update("started")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AccessDenied);

        let listed = tracker.list(&other, ListFilter::default()).await.unwrap();
        assert!(listed.is_empty());

        // The master pseudo-application sees and may drive everything.
        let master = AuthContext::master();
        assert!(tracker.get(&master, &id).await.is_ok());
        let listed = tracker.list(&master, ListFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_two_identical_submissions_get_distinct_ids() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let first = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        let second = tracker.submit(&auth, new_job("email", &[])).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_register_webhooks_merges() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker
            .submit(
                &auth,
                NewJob {
                    webhooks: Some(
                        [("completed".to_string(), "https://a.example/done".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..new_job("email", &[])
                },
            )
            .await
            .unwrap();

        let job = tracker
            .register_webhooks(
                &auth,
                &id.to_string(),
                [("failed".to_string(), "https://a.example/failed".to_string())]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();
        assert_eq!(job.webhooks.len(), 2);

        let err = tracker
            .register_webhooks(
                &auth,
                &id.to_string(),
                [("bogus".to_string(), "https://a.example/x".to_string())]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_metadata_superset_matching() {
        let tracker = tracker();
        let auth = auth("app_1", &["email"]);
        let id = tracker
            .submit(
                &auth,
                new_job("email", &[("priority", json!("high")), ("customerId", json!("c1"))]),
            )
            .await
            .unwrap();

        // A subset of the job's metadata matches.
        let subset = tracker
            .list(
                &auth,
                ListFilter {
                    metadata: [("priority".to_string(), "high".to_string())]
                        .into_iter()
                        .collect(),
                    ..ListFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].id, id);

        // A key the job does not carry excludes it.
        let miss = tracker
            .list(
                &auth,
                ListFilter {
                    metadata: [("region".to_string(), "eu".to_string())].into_iter().collect(),
                    ..ListFilter::default()
                },
            )
            .await
            .unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_and_bad_ids() {
        let tracker = tracker();
        let auth = auth("app_1", &["*"]);

        let err = tracker.get(&auth, "not-a-uuid").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFound);

        let err = tracker
            .get(&auth, &JobId::new().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_shutdown_stops_submissions() {
        let tracker = tracker();
        tracker.stop_accepting();
        let err = tracker
            .submit(&auth("app_1", &["*"]), new_job("email", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BackingStoreUnavailable);
    }
}
