//! Redis implementation of the backing store.
//!
//! Keyspace (prefix `rq:`):
//!
//! - `rq:queues` — set of materialized queue names
//! - `rq:q:{queue}:waiting|active|completed|failed` — bucket lists,
//!   newest at the head
//! - `rq:q:{queue}:delayed` — zset scored by fire time (ms)
//! - `rq:q:{queue}:paused` — pause flag
//! - `rq:q:{queue}:meta` — queue metadata hash
//! - `rq:job:{id}` — job hash, `rq:job:{id}:updates` — history list
//! - `rq:idx:{app}:{key}:{value}` — metadata index sets
//! - `rq:repeat:{queue}` — timer zset, `rq:repeat:{queue}:defs` — defs hash
//! - channel `rq:events:{queue}` — pub/sub lifecycle events
//!
//! Transitions run through a Lua compare-and-set so a losing writer gets a
//! `CONFLICT` instead of clobbering a terminal job. Pool connections carry
//! command traffic; pub/sub uses dedicated connections from the client
//! because pooled connections cannot subscribe.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Pool, Runtime};
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{RedisSettings, RetentionSettings};
use crate::jobs::{JobId, JobRecord, JobStatus, JobUpdateEntry};

use super::{
    BackingStore, EventStream, QueueCounts, RepeatSpec, StoreError, StoreEvent, StoreEventKind,
    StoreResult, Transition,
};

const KEY_PREFIX: &str = "rq";
const PROMOTE_BATCH: isize = 100;

/// Compare-and-set transition script.
///
/// KEYS: job hash, from-bucket list, to-bucket list, updates list.
/// ARGV: expected status, new status, move flag, job id, history entry,
/// retention ttl (0 = none), then alternating patch field/value pairs.
const TRANSITION_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return redis.error_reply('NOTFOUND')
end
if status ~= ARGV[1] then
  return redis.error_reply('CONFLICT ' .. status)
end
redis.call('HSET', KEYS[1], 'status', ARGV[2])
if ARGV[3] == '1' then
  redis.call('LREM', KEYS[2], 1, ARGV[4])
  redis.call('LPUSH', KEYS[3], ARGV[4])
end
redis.call('RPUSH', KEYS[4], ARGV[5])
local ttl = tonumber(ARGV[6])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
  redis.call('EXPIRE', KEYS[4], ttl)
end
for i = 7, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
";

/// Claim script: pop the oldest waiting job and mark it active.
///
/// KEYS: waiting list, active list, paused flag.
/// ARGV: job key prefix, started-at timestamp.
const CLAIM_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[3]) == 1 then
  return false
end
local id = redis.call('RPOP', KEYS[1])
if not id then
  return false
end
redis.call('LPUSH', KEYS[2], id)
redis.call('HSET', ARGV[1] .. id, 'status', 'active', 'started_at', ARGV[2])
return id
";

fn job_key(id: JobId) -> String {
    format!("{KEY_PREFIX}:job:{id}")
}

fn updates_key(id: JobId) -> String {
    format!("{KEY_PREFIX}:job:{id}:updates")
}

fn bucket_key(queue: &str, status: JobStatus) -> String {
    format!("{KEY_PREFIX}:q:{queue}:{}", status.name())
}

fn paused_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:q:{queue}:paused")
}

fn meta_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:q:{queue}:meta")
}

fn queues_key() -> String {
    format!("{KEY_PREFIX}:queues")
}

fn index_key(application_id: &str, key: &str, value: &str) -> String {
    format!("{KEY_PREFIX}:idx:{application_id}:{key}:{value}")
}

fn repeat_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:repeat:{queue}")
}

fn repeat_defs_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:repeat:{queue}:defs")
}

fn events_channel(queue: &str) -> String {
    format!("{KEY_PREFIX}:events:{queue}")
}

/// A repeat definition with its firing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRepeat {
    spec: RepeatSpec,
    fired: u64,
}

impl StoredRepeat {
    fn exhausted(&self) -> bool {
        self.spec.limit.is_some_and(|limit| self.fired >= limit)
    }
}

fn record_to_pairs(job: &JobRecord) -> StoreResult<Vec<(String, String)>> {
    let mut pairs = vec![
        ("id".to_string(), job.id.to_string()),
        ("queue".to_string(), job.queue.clone()),
        ("application_id".to_string(), job.application_id.clone()),
        ("data".to_string(), serde_json::to_string(&job.data)?),
        (
            "metadata".to_string(),
            serde_json::to_string(&job.metadata)?,
        ),
        ("status".to_string(), job.status.name().to_string()),
        ("progress".to_string(), job.progress.to_string()),
        ("submitted_at".to_string(), job.submitted_at.to_rfc3339()),
        (
            "webhooks".to_string(),
            serde_json::to_string(&job.webhooks)?,
        ),
    ];
    if let Some(result) = &job.result {
        pairs.push(("result".to_string(), serde_json::to_string(result)?));
    }
    if let Some(error) = &job.error {
        pairs.push(("error".to_string(), error.clone()));
    }
    if let Some(at) = job.started_at {
        pairs.push(("started_at".to_string(), at.to_rfc3339()));
    }
    if let Some(at) = job.completed_at {
        pairs.push(("completed_at".to_string(), at.to_rfc3339()));
    }
    if let Some(at) = job.failed_at {
        pairs.push(("failed_at".to_string(), at.to_rfc3339()));
    }
    Ok(pairs)
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn record_from_fields(
    fields: &HashMap<String, String>,
    updates: Vec<JobUpdateEntry>,
) -> StoreResult<JobRecord> {
    let field = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("job hash missing field {name}")))
    };

    let id: JobId = field("id")?
        .parse()
        .map_err(|_| StoreError::Corrupt("bad job id".to_string()))?;
    let status: JobStatus = field("status")?
        .parse()
        .map_err(StoreError::Corrupt)?;
    let submitted_at = parse_time(fields, "submitted_at")
        .ok_or_else(|| StoreError::Corrupt("bad submitted_at".to_string()))?;

    Ok(JobRecord {
        id,
        queue: field("queue")?,
        application_id: field("application_id")?,
        data: serde_json::from_str(&field("data")?)?,
        metadata: fields
            .get("metadata")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default(),
        status,
        progress: fields
            .get("progress")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        result: fields
            .get("result")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?,
        error: fields.get("error").cloned(),
        submitted_at,
        started_at: parse_time(fields, "started_at"),
        completed_at: parse_time(fields, "completed_at"),
        failed_at: parse_time(fields, "failed_at"),
        webhooks: fields
            .get("webhooks")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default(),
        updates,
    })
}

/// Redis-backed [`BackingStore`].
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    retention: RetentionSettings,
    transition: redis::Script,
    claim: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is malformed or the pool cannot be
    /// created. Connections themselves are established lazily.
    pub fn connect(
        settings: &RedisSettings,
        retention: RetentionSettings,
    ) -> StoreResult<Self> {
        let url = settings.url();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(host = %settings.host, port = settings.port, tls = settings.uses_tls(), "redis store configured");
        Ok(Self {
            pool,
            client,
            retention,
            transition: redis::Script::new(TRANSITION_SCRIPT),
            claim: redis::Script::new(CLAIM_SCRIPT),
        })
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn publish(&self, event: &StoreEvent) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(event)?;
        let _: () = conn
            .publish(events_channel(&event.queue), payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn fetch_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        job_id: JobId,
    ) -> StoreResult<Option<JobRecord>> {
        let fields: HashMap<String, String> =
            conn.hgetall(job_key(job_id)).await.map_err(unavailable)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let raw_updates: Vec<String> = conn
            .lrange(updates_key(job_id), 0, -1)
            .await
            .map_err(unavailable)?;
        let mut updates = Vec::with_capacity(raw_updates.len());
        for raw in raw_updates {
            updates.push(serde_json::from_str(&raw)?);
        }
        record_from_fields(&fields, updates).map(Some)
    }

    async fn write_repeat(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        stored: &StoredRepeat,
        next: DateTime<Utc>,
    ) -> StoreResult<()> {
        let def = serde_json::to_string(stored)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(repeat_defs_key(queue), &stored.spec.key, def)
            .ignore()
            .zadd(repeat_key(queue), &stored.spec.key, next.timestamp_millis())
            .ignore();
        let _: () = pipe.query_async(&mut *conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn promote_queue(&self, queue: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut promoted = 0;
        let mut conn = self.conn().await?;
        let now_ms = now.timestamp_millis();

        // Due delayed jobs move to waiting.
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(bucket_key(queue, JobStatus::Delayed))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        for id in due {
            let Ok(job_id) = id.parse::<JobId>() else {
                warn!(%queue, raw = %id, "skipping malformed delayed entry");
                continue;
            };
            let mut pipe = redis::pipe();
            pipe.atomic()
                .zrem(bucket_key(queue, JobStatus::Delayed), &id)
                .ignore()
                .lpush(bucket_key(queue, JobStatus::Waiting), &id)
                .ignore()
                .hset(job_key(job_id), "status", JobStatus::Waiting.name())
                .ignore();
            let _: () = pipe.query_async(&mut *conn).await.map_err(unavailable)?;
            promoted += 1;
        }

        // Due repeatable timers materialize a job each.
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(repeat_key(queue))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        for key in due {
            let raw: Option<String> = conn
                .hget(repeat_defs_key(queue), &key)
                .await
                .map_err(unavailable)?;
            let Some(raw) = raw else {
                let _: () = conn
                    .zrem(repeat_key(queue), &key)
                    .await
                    .map_err(unavailable)?;
                continue;
            };
            let mut stored: StoredRepeat = serde_json::from_str(&raw)?;

            let fire_allowed = !stored.exhausted()
                && !stored.spec.end_date.is_some_and(|end| now > end);
            if fire_allowed {
                let job = materialize_repeat_job(&stored.spec, queue, now);
                drop(conn);
                self.enqueue(&job, None).await?;
                conn = self.conn().await?;
                stored.fired += 1;
                promoted += 1;
            }

            let next = if stored.exhausted() {
                None
            } else {
                stored.spec.next_fire(now)
            };
            match next {
                Some(next) => self.write_repeat(&mut conn, queue, &stored, next).await?,
                None => {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .hdel(repeat_defs_key(queue), &key)
                        .ignore()
                        .zrem(repeat_key(queue), &key)
                        .ignore();
                    let _: () = pipe.query_async(&mut *conn).await.map_err(unavailable)?;
                }
            }
        }

        Ok(promoted)
    }
}

fn materialize_repeat_job(spec: &RepeatSpec, queue: &str, now: DateTime<Utc>) -> JobRecord {
    JobRecord {
        id: JobId::new(),
        queue: queue.to_string(),
        application_id: spec.application_id.clone(),
        data: spec.payload.clone(),
        metadata: HashMap::new(),
        status: JobStatus::Waiting,
        progress: 0,
        result: None,
        error: None,
        submitted_at: now,
        started_at: None,
        completed_at: None,
        failed_at: None,
        webhooks: HashMap::new(),
        updates: Vec::new(),
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn register_queue(&self, queue: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let added: i64 = conn
            .sadd(queues_key(), queue)
            .await
            .map_err(unavailable)?;
        if added == 1 {
            let _: () = conn
                .hset_multiple(
                    meta_key(queue),
                    &[
                        ("created_at", Utc::now().to_rfc3339()),
                        (
                            "completed_retention_secs",
                            self.retention.completed_secs.to_string(),
                        ),
                        (
                            "failed_retention_secs",
                            self.retention.failed_secs.to_string(),
                        ),
                    ],
                )
                .await
                .map_err(unavailable)?;
            debug!(%queue, "queue materialized");
        }
        Ok(())
    }

    async fn queues(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut queues: Vec<String> =
            conn.smembers(queues_key()).await.map_err(unavailable)?;
        queues.sort();
        Ok(queues)
    }

    async fn enqueue(&self, job: &JobRecord, delay_ms: Option<u64>) -> StoreResult<()> {
        let pairs = record_to_pairs(job)?;
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(job_key(job.id), &pairs).ignore();
        match delay_ms {
            Some(delay) => {
                let run_at =
                    job.submitted_at.timestamp_millis() + i64::try_from(delay).unwrap_or(0);
                pipe.zadd(
                    bucket_key(&job.queue, JobStatus::Delayed),
                    job.id.to_string(),
                    run_at,
                )
                .ignore();
            }
            None => {
                pipe.lpush(
                    bucket_key(&job.queue, JobStatus::Waiting),
                    job.id.to_string(),
                )
                .ignore();
            }
        }
        let _: () = pipe.query_async(&mut *conn).await.map_err(unavailable)?;
        drop(conn);

        let index: Vec<(String, String)> = job
            .metadata
            .iter()
            .filter_map(|(k, v)| crate::jobs::metadata_string(v).map(|s| (k.clone(), s)))
            .collect();
        if !index.is_empty() {
            self.index_metadata(&job.application_id, job.id, &index)
                .await?;
        }

        self.publish(&StoreEvent {
            event: StoreEventKind::Added,
            queue: job.queue.clone(),
            job_id: job.id,
            timestamp: job.submitted_at,
        })
        .await
    }

    async fn claim_next(&self, queue: &str) -> StoreResult<Option<JobRecord>> {
        let now = Utc::now();
        let mut conn = self.conn().await?;
        let claimed: Option<String> = self
            .claim
            .key(bucket_key(queue, JobStatus::Waiting))
            .key(bucket_key(queue, JobStatus::Active))
            .key(paused_key(queue))
            .arg(format!("{KEY_PREFIX}:job:"))
            .arg(now.to_rfc3339())
            .invoke_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        let Some(raw) = claimed else {
            return Ok(None);
        };
        let job_id: JobId = raw
            .parse()
            .map_err(|_| StoreError::Corrupt("bad claimed job id".to_string()))?;
        let job = self
            .fetch_job(&mut conn, job_id)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        drop(conn);

        self.publish(&StoreEvent {
            event: StoreEventKind::Active,
            queue: queue.to_string(),
            job_id,
            timestamp: now,
        })
        .await?;
        Ok(Some(job))
    }

    async fn apply_transition(
        &self,
        queue: &str,
        job_id: JobId,
        transition: &Transition,
    ) -> StoreResult<JobRecord> {
        let entry_json = serde_json::to_string(&transition.entry)?;
        let needs_move = transition.expected_from != transition.to;
        let ttl = transition.retention_ttl_secs.unwrap_or(0);

        let mut patch: Vec<(String, String)> = Vec::new();
        if let Some(progress) = transition.progress {
            patch.push(("progress".to_string(), progress.to_string()));
        }
        if let Some(result) = &transition.result {
            patch.push(("result".to_string(), serde_json::to_string(result)?));
        }
        if let Some(error) = &transition.error {
            patch.push(("error".to_string(), error.clone()));
        }
        if let Some(metadata) = &transition.metadata {
            patch.push(("metadata".to_string(), serde_json::to_string(metadata)?));
        }
        let stamp = transition.timestamp.to_rfc3339();
        match (transition.expected_from, transition.to) {
            (JobStatus::Waiting, JobStatus::Active) => {
                patch.push(("started_at".to_string(), stamp));
            }
            (_, JobStatus::Completed) => {
                patch.push(("completed_at".to_string(), stamp));
            }
            (_, JobStatus::Failed) => {
                patch.push(("failed_at".to_string(), stamp));
            }
            _ => {}
        }

        let mut conn = self.conn().await?;
        let mut invocation = self.transition.prepare_invoke();
        invocation
            .key(job_key(job_id))
            .key(bucket_key(queue, transition.expected_from))
            .key(bucket_key(queue, transition.to))
            .key(updates_key(job_id))
            .arg(transition.expected_from.name())
            .arg(transition.to.name())
            .arg(if needs_move { "1" } else { "0" })
            .arg(job_id.to_string())
            .arg(entry_json)
            .arg(ttl);
        for (field, value) in &patch {
            invocation.arg(field).arg(value);
        }

        let result: Result<i64, redis::RedisError> =
            invocation.invoke_async(&mut *conn).await;
        if let Err(err) = result {
            let detail = err.to_string();
            if detail.contains("NOTFOUND") {
                return Err(StoreError::JobNotFound(job_id));
            }
            if detail.contains("CONFLICT") {
                return Err(StoreError::Conflict(format!(
                    "job {job_id} is not {} anymore",
                    transition.expected_from
                )));
            }
            return Err(unavailable(err));
        }

        let job = self
            .fetch_job(&mut conn, job_id)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        drop(conn);

        self.publish(&StoreEvent {
            event: transition.event,
            queue: queue.to_string(),
            job_id,
            timestamp: transition.timestamp,
        })
        .await?;
        Ok(job)
    }

    async fn merge_webhooks(
        &self,
        job_id: JobId,
        hooks: &HashMap<String, String>,
    ) -> StoreResult<JobRecord> {
        let mut conn = self.conn().await?;
        let mut job = self
            .fetch_job(&mut conn, job_id)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.webhooks
            .extend(hooks.iter().map(|(k, v)| (k.clone(), v.clone())));
        let _: () = conn
            .hset(
                job_key(job_id),
                "webhooks",
                serde_json::to_string(&job.webhooks)?,
            )
            .await
            .map_err(unavailable)?;
        Ok(job)
    }

    async fn job(&self, job_id: JobId) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        self.fetch_job(&mut conn, job_id).await
    }

    async fn jobs_in(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let mut conn = self.conn().await?;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = if status == JobStatus::Delayed {
            redis::cmd("ZREVRANGE")
                .arg(bucket_key(queue, status))
                .arg(0)
                .arg(stop)
                .query_async(&mut *conn)
                .await
                .map_err(unavailable)?
        } else {
            conn.lrange(bucket_key(queue, status), 0, stop)
                .await
                .map_err(unavailable)?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(job_id) = id.parse::<JobId>() else {
                continue;
            };
            // Expired hashes leave stale bucket entries; readers skip them.
            if let Some(job) = self.fetch_job(&mut conn, job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn ids_by_metadata(
        &self,
        application_id: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn
            .smembers(index_key(application_id, key, value))
            .await
            .map_err(unavailable)?;
        Ok(members
            .into_iter()
            .filter_map(|raw| raw.parse().ok())
            .collect())
    }

    async fn index_metadata(
        &self,
        application_id: &str,
        job_id: JobId,
        pairs: &[(String, String)],
    ) -> StoreResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for (key, value) in pairs {
            pipe.sadd(index_key(application_id, key, value), job_id.to_string())
                .ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn pause(&self, queue: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set(paused_key(queue), "1")
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(paused_key(queue)).await.map_err(unavailable)?;
        Ok(())
    }

    async fn clean(&self, queue: &str, grace_ms: u64, bound: usize) -> StoreResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(
            i64::try_from(grace_ms).unwrap_or(i64::MAX),
        );
        let mut removed = 0;
        let mut conn = self.conn().await?;

        for status in [JobStatus::Completed, JobStatus::Failed] {
            let bucket = bucket_key(queue, status);
            let stop = isize::try_from(bound).unwrap_or(isize::MAX) - 1;
            let ids: Vec<String> =
                conn.lrange(&bucket, 0, stop).await.map_err(unavailable)?;
            for id in ids {
                let Ok(job_id) = id.parse::<JobId>() else {
                    let _: () = conn.lrem(&bucket, 0, &id).await.map_err(unavailable)?;
                    continue;
                };
                let fields: HashMap<String, String> =
                    conn.hgetall(job_key(job_id)).await.map_err(unavailable)?;
                let terminal_at = match status {
                    JobStatus::Completed => parse_time(&fields, "completed_at"),
                    _ => parse_time(&fields, "failed_at"),
                };
                let expired_hash = fields.is_empty();
                let old_enough = terminal_at.is_some_and(|at| at < cutoff);
                if expired_hash || old_enough {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .del(job_key(job_id))
                        .ignore()
                        .del(updates_key(job_id))
                        .ignore()
                        .lrem(&bucket, 0, &id)
                        .ignore();
                    let _: () =
                        pipe.query_async(&mut *conn).await.map_err(unavailable)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn stats(&self, queue: &str) -> StoreResult<QueueCounts> {
        let mut conn = self.conn().await?;
        let (waiting, active, completed, failed, delayed, paused): (
            u64,
            u64,
            u64,
            u64,
            u64,
            bool,
        ) = redis::pipe()
            .llen(bucket_key(queue, JobStatus::Waiting))
            .llen(bucket_key(queue, JobStatus::Active))
            .llen(bucket_key(queue, JobStatus::Completed))
            .llen(bucket_key(queue, JobStatus::Failed))
            .zcard(bucket_key(queue, JobStatus::Delayed))
            .exists(paused_key(queue))
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused,
        })
    }

    async fn schedule_repeatable(&self, queue: &str, spec: &RepeatSpec) -> StoreResult<String> {
        let now = Utc::now();
        let next = spec.next_fire(now).ok_or_else(|| {
            StoreError::Conflict(format!("timer {} has no future fire", spec.key))
        })?;
        let stored = StoredRepeat {
            spec: spec.clone(),
            fired: 0,
        };
        let mut conn = self.conn().await?;
        self.write_repeat(&mut conn, queue, &stored, next).await?;
        Ok(spec.key.clone())
    }

    async fn schedule_once(&self, queue: &str, spec: &RepeatSpec) -> StoreResult<String> {
        // One-shot timers share the repeat machinery; the promoter removes
        // the definition after the single fire.
        self.schedule_repeatable(queue, spec).await
    }

    async fn cancel_repeatable(&self, queue: &str, handle: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(repeat_defs_key(queue), handle)
            .ignore()
            .zrem(repeat_key(queue), handle)
            .ignore();
        let _: () = pipe.query_async(&mut *conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn repeat_handles(&self, queue: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let handles: Vec<String> = conn
            .hkeys(repeat_defs_key(queue))
            .await
            .map_err(unavailable)?;
        Ok(handles)
    }

    async fn subscribe_events(&self, queue: &str) -> StoreResult<EventStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(unavailable)?;
        pubsub
            .subscribe(events_channel(queue))
            .await
            .map_err(unavailable)?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str::<StoreEvent>(&payload) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(error = %err, "dropping undecodable store event");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut total = 0;
        for queue in self.queues().await? {
            total += self.promote_queue(&queue, now).await?;
        }
        Ok(total)
    }
}
