//! Backing-store adapter.
//!
//! The broker persists jobs in a Redis-compatible store offering atomic
//! ordered queues, delayed and repeatable primitives and a pub/sub event
//! stream. The core depends on the [`BackingStore`] trait; [`redis::RedisStore`]
//! is the production implementation and `testing::MemoryStore` backs the
//! test suite.
//!
//! Failure semantics: connection errors are retriable and surface as
//! [`StoreError::Unavailable`]; state-transition conflicts (completing an
//! already-terminal job, claiming a claimed job) are domain errors and
//! surface as [`StoreError::Conflict`].

pub mod redis;

use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::jobs::{JobEventKind, JobId, JobRecord, JobStatus, JobUpdateEntry};

/// Errors raised by backing-store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store is unreachable or timed out; retriable.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-set transition lost; non-retriable domain error.
    #[error("{0}")]
    Conflict(String),

    /// The referenced job does not exist.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The referenced queue was never materialized.
    #[error("queue {0} not found")]
    QueueNotFound(String),

    /// A stored value failed to decode.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// An event emitted by the store when a job changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    /// The transition (`added`, `active`, `progress`, `completed`,
    /// `failed`, `stalled`).
    pub event: StoreEventKind,
    /// Queue the job lives in.
    pub queue: String,
    /// Job id.
    pub job_id: JobId,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// Store-level event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreEventKind {
    /// Job accepted into the queue.
    Added,
    /// Job moved to active.
    Active,
    /// Progress reported.
    Progress,
    /// Job completed.
    Completed,
    /// Job failed.
    Failed,
    /// Worker lease expired.
    Stalled,
}

impl StoreEventKind {
    /// The job-level event this store event fans out as.
    #[must_use]
    pub const fn as_job_event(self) -> JobEventKind {
        match self {
            Self::Added => JobEventKind::Created,
            Self::Active => JobEventKind::Started,
            Self::Progress => JobEventKind::Progress,
            Self::Completed => JobEventKind::Completed,
            Self::Failed => JobEventKind::Failed,
            Self::Stalled => JobEventKind::Stalled,
        }
    }
}

/// A state transition to apply under compare-and-set.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Status the job must currently hold.
    pub expected_from: JobStatus,
    /// Status after the transition.
    pub to: JobStatus,
    /// Event published on success.
    pub event: StoreEventKind,
    /// New progress value, when reported.
    pub progress: Option<u8>,
    /// Result payload, for completion.
    pub result: Option<serde_json::Value>,
    /// Error message, for failure.
    pub error: Option<String>,
    /// Full metadata map after merging update metadata, when it changed.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// History entry appended with the transition.
    pub entry: JobUpdateEntry,
    /// TTL set on the job when the transition is terminal.
    pub retention_ttl_secs: Option<u64>,
    /// When the transition was requested.
    pub timestamp: DateTime<Utc>,
}

impl Transition {
    /// Apply this transition's field changes to an in-memory record.
    /// Status and history are handled by the store implementation.
    pub fn apply_fields(&self, job: &mut JobRecord) {
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        if let Some(metadata) = &self.metadata {
            job.metadata = metadata.clone();
        }
        match (self.expected_from, self.to) {
            (JobStatus::Waiting, JobStatus::Active) => {
                job.started_at = Some(self.timestamp);
            }
            (_, JobStatus::Completed) => {
                job.completed_at = Some(self.timestamp);
            }
            (_, JobStatus::Failed) => {
                job.failed_at = Some(self.timestamp);
            }
            _ => {}
        }
    }
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    /// Jobs waiting to be claimed.
    pub waiting: u64,
    /// Jobs currently active.
    pub active: u64,
    /// Completed jobs still inside the retention window.
    pub completed: u64,
    /// Failed jobs still inside the retention window.
    pub failed: u64,
    /// Jobs parked on a timer.
    pub delayed: u64,
    /// Whether the queue is paused.
    pub paused: bool,
}

/// Definition of a repeatable or one-shot timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatSpec {
    /// Stable key identifying the timer; doubles as the opaque handle.
    pub key: String,
    /// Cron pattern; mutually exclusive with `at`.
    pub cron: Option<String>,
    /// IANA timezone for cron evaluation; UTC when unset.
    pub timezone: Option<String>,
    /// One-shot fire instant; mutually exclusive with `cron`.
    pub at: Option<DateTime<Utc>>,
    /// Stop firing after this instant.
    pub end_date: Option<DateTime<Utc>>,
    /// Stop after this many fires.
    pub limit: Option<u64>,
    /// Application the materialized jobs belong to.
    pub application_id: String,
    /// Payload of each materialized job.
    pub payload: serde_json::Value,
}

/// Lazy sequence of store events; finite only on close, restartable by
/// calling [`BackingStore::subscribe_events`] again.
pub type EventStream = Pin<Box<dyn Stream<Item = StoreEvent> + Send>>;

/// The Redis-compatible primitive seam.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;

    /// Idempotently materialize a queue.
    async fn register_queue(&self, queue: &str) -> StoreResult<()>;

    /// All materialized queue names.
    async fn queues(&self) -> StoreResult<Vec<String>>;

    /// Persist and enqueue a job; `delay_ms` parks it on the delayed timer.
    async fn enqueue(&self, job: &JobRecord, delay_ms: Option<u64>) -> StoreResult<()>;

    /// Atomically claim the oldest waiting job, or `None` when the queue is
    /// empty or paused.
    async fn claim_next(&self, queue: &str) -> StoreResult<Option<JobRecord>>;

    /// Apply a compare-and-set state transition and return the updated job.
    async fn apply_transition(
        &self,
        queue: &str,
        job_id: JobId,
        transition: &Transition,
    ) -> StoreResult<JobRecord>;

    /// Merge per-job webhook registrations and return the updated job.
    async fn merge_webhooks(
        &self,
        job_id: JobId,
        hooks: &HashMap<String, String>,
    ) -> StoreResult<JobRecord>;

    /// Fetch a job snapshot.
    async fn job(&self, job_id: JobId) -> StoreResult<Option<JobRecord>>;

    /// Jobs of one status bucket in one queue, newest first.
    async fn jobs_in(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>>;

    /// Ids recorded under a metadata index entry.
    async fn ids_by_metadata(
        &self,
        application_id: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<Vec<JobId>>;

    /// Record metadata index entries for a job (`(key, string value)` pairs).
    async fn index_metadata(
        &self,
        application_id: &str,
        job_id: JobId,
        pairs: &[(String, String)],
    ) -> StoreResult<()>;

    /// Pause claiming on a queue.
    async fn pause(&self, queue: &str) -> StoreResult<()>;

    /// Resume claiming on a queue.
    async fn resume(&self, queue: &str) -> StoreResult<()>;

    /// Remove terminal jobs older than `grace_ms`, scanning at most
    /// `bound` entries per bucket. Returns the number removed.
    async fn clean(&self, queue: &str, grace_ms: u64, bound: usize) -> StoreResult<u64>;

    /// Counters for a queue.
    async fn stats(&self, queue: &str) -> StoreResult<QueueCounts>;

    /// Register a repeatable timer; returns the opaque handle.
    async fn schedule_repeatable(&self, queue: &str, spec: &RepeatSpec) -> StoreResult<String>;

    /// Register a one-shot timer; returns the opaque handle.
    async fn schedule_once(&self, queue: &str, spec: &RepeatSpec) -> StoreResult<String>;

    /// Cancel a repeatable or one-shot timer. Unknown handles are a no-op.
    async fn cancel_repeatable(&self, queue: &str, handle: &str) -> StoreResult<()>;

    /// Handles of live timers on a queue (startup reconciliation).
    async fn repeat_handles(&self, queue: &str) -> StoreResult<Vec<String>>;

    /// Subscribe to a queue's event channel.
    async fn subscribe_events(&self, queue: &str) -> StoreResult<EventStream>;

    /// Move due delayed jobs to waiting and fire due timers. Returns how
    /// many jobs were promoted or materialized.
    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Spawn the due-work promoter: a loop that moves fired delayed jobs to
/// waiting and materializes due repeatable timers.
pub fn spawn_promoter(
    store: Arc<dyn BackingStore>,
    shutdown: crate::shutdown::ShutdownToken,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("promoter started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            match store.promote_due(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(count, "promoted due work"),
                Err(err) => tracing::warn!(error = %err, "promoter pass failed"),
            }
        }
        tracing::debug!("promoter stopped");
    })
}

/// Accept a standard five-field cron pattern by prefixing a seconds field;
/// six- and seven-field patterns pass through unchanged.
#[must_use]
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Next fire instant of a cron pattern after `after`, evaluated in
/// `timezone` (UTC when unset). `None` when the pattern is invalid, the
/// timezone is unknown, or the pattern has no future occurrence.
#[must_use]
pub fn next_cron_occurrence(
    expression: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(&normalize_cron(expression)).ok()?;
    let tz: Tz = match timezone {
        Some(name) => name.parse().ok()?,
        None => chrono_tz::UTC,
    };
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

impl RepeatSpec {
    /// The fire instant following `after`, or `None` when exhausted.
    #[must_use]
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match (&self.cron, self.at) {
            (Some(cron), _) => next_cron_occurrence(cron, self.timezone.as_deref(), after)?,
            (None, Some(at)) if at > after => at,
            _ => return None,
        };
        if self.end_date.is_some_and(|end| next > end) {
            return None;
        }
        Some(next)
    }
}
