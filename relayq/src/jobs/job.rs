//! Core job types: identifiers, statuses, lifecycle events and records.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Canonical status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, not yet claimed by a worker.
    Waiting,
    /// Claimed and executing.
    Active,
    /// Finished successfully; `result` is set.
    Completed,
    /// Finished unsuccessfully; `error` is set.
    Failed,
    /// Parked until a timer fires, then moves to waiting.
    Delayed,
}

impl JobStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A lifecycle transition observed on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventKind {
    /// Job accepted and enqueued.
    Created,
    /// Job claimed by a worker.
    Started,
    /// Progress reported while active.
    Progress,
    /// Job completed.
    Completed,
    /// Job failed.
    Failed,
    /// Worker stopped heartbeating (internal).
    Stalled,
}

impl JobEventKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry in a job's ordered update history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateEntry {
    /// The posted update kind (`started`, `progress`, `completed`, `failed`).
    pub status: String,
    /// Progress value, for progress updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Result payload, for completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message, for failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Metadata merged in with the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// When the update was applied.
    pub timestamp: DateTime<Utc>,
}

/// Canonical persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique id.
    pub id: JobId,
    /// Queue the job belongs to.
    pub queue: String,
    /// Owning application; immutable after creation.
    pub application_id: String,
    /// Opaque payload.
    pub data: serde_json::Value,
    /// Scalar-or-nested metadata used for filtering.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Current status.
    pub status: JobStatus,
    /// Progress, 0–100.
    #[serde(default)]
    pub progress: u8,
    /// Result payload; present iff completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message; present iff failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// When the job was claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Per-job webhook map, event name (or `*`) to URL.
    #[serde(default)]
    pub webhooks: HashMap<String, String>,
    /// Ordered update history.
    #[serde(default)]
    pub updates: Vec<JobUpdateEntry>,
}

/// A lifecycle event paired with the job snapshot it describes.
#[derive(Debug, Clone)]
pub struct JobEvent {
    /// What happened.
    pub kind: JobEventKind,
    /// The job after the transition.
    pub job: JobRecord,
    /// When the transition was applied.
    pub timestamp: DateTime<Utc>,
}

/// The string form of a metadata value used for equality filtering.
///
/// Scalars compare on their string rendering (`5` matches `"5"`); nested
/// values never match a filter.
#[must_use]
pub fn metadata_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Null => Some("null".to_string()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
    }
}
