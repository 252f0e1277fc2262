//! Test support: an in-memory backing store and fixture helpers.
//!
//! `MemoryStore` implements the full [`BackingStore`] contract — buckets,
//! CAS transitions, delayed and repeatable timers, metadata indexes and a
//! broadcast-backed event stream — without a Redis instance. The scenario
//! tests and any embedding that wants a hermetic broker run against it.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::{metadata_string, JobId, JobRecord, JobStatus};
use crate::store::{
    BackingStore, EventStream, QueueCounts, RepeatSpec, StoreError, StoreEvent, StoreEventKind,
    StoreResult, Transition,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRepeat {
    spec: RepeatSpec,
    fired: u64,
    next_ms: i64,
}

impl StoredRepeat {
    fn exhausted(&self) -> bool {
        self.spec.limit.is_some_and(|limit| self.fired >= limit)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    // Front of each bucket is the newest entry.
    waiting: VecDeque<JobId>,
    active: VecDeque<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    delayed: Vec<(i64, JobId)>,
    paused: bool,
    repeats: HashMap<String, StoredRepeat>,
}

impl QueueState {
    fn bucket_mut(&mut self, status: JobStatus) -> &mut VecDeque<JobId> {
        match status {
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Active => &mut self.active,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Delayed => unreachable!("delayed jobs live in the timer set"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    jobs: HashMap<JobId, JobRecord>,
    index: HashMap<(String, String, String), HashSet<JobId>>,
}

/// In-process [`BackingStore`] for tests and hermetic deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<StoreEvent>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, queue: &str) -> broadcast::Sender<StoreEvent> {
        self.channels
            .lock()
            .entry(queue.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
            .clone()
    }

    fn publish(&self, event: StoreEvent) {
        // Send fails only when nobody subscribed, which is fine.
        let _ = self.sender(&event.queue).send(event);
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
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn register_queue(&self, queue: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn queues(&self) -> StoreResult<Vec<String>> {
        let mut queues: Vec<String> = self.inner.lock().queues.keys().cloned().collect();
        queues.sort();
        Ok(queues)
    }

    async fn enqueue(&self, job: &JobRecord, delay_ms: Option<u64>) -> StoreResult<()> {
        let event = {
            let mut inner = self.inner.lock();
            let state = inner.queues.entry(job.queue.clone()).or_default();
            match delay_ms {
                Some(delay) => {
                    let run_at = job.submitted_at.timestamp_millis()
                        + i64::try_from(delay).unwrap_or(0);
                    state.delayed.push((run_at, job.id));
                }
                None => state.waiting.push_front(job.id),
            }
            for (key, value) in &job.metadata {
                if let Some(value) = metadata_string(value) {
                    inner
                        .index
                        .entry((job.application_id.clone(), key.clone(), value))
                        .or_default()
                        .insert(job.id);
                }
            }
            inner.jobs.insert(job.id, job.clone());
            StoreEvent {
                event: StoreEventKind::Added,
                queue: job.queue.clone(),
                job_id: job.id,
                timestamp: job.submitted_at,
            }
        };
        self.publish(event);
        Ok(())
    }

    async fn claim_next(&self, queue: &str) -> StoreResult<Option<JobRecord>> {
        let now = Utc::now();
        let claimed = {
            let mut inner = self.inner.lock();
            let state = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
            if state.paused {
                None
            } else if let Some(id) = state.waiting.pop_back() {
                state.active.push_front(id);
                let job = inner
                    .jobs
                    .get_mut(&id)
                    .ok_or(StoreError::JobNotFound(id))?;
                job.status = JobStatus::Active;
                job.started_at = Some(now);
                Some(job.clone())
            } else {
                None
            }
        };

        if let Some(job) = &claimed {
            self.publish(StoreEvent {
                event: StoreEventKind::Active,
                queue: queue.to_string(),
                job_id: job.id,
                timestamp: now,
            });
        }
        Ok(claimed)
    }

    async fn apply_transition(
        &self,
        queue: &str,
        job_id: JobId,
        transition: &Transition,
    ) -> StoreResult<JobRecord> {
        let updated = {
            let mut inner = self.inner.lock();
            let current = inner
                .jobs
                .get(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?
                .status;
            if current != transition.expected_from {
                return Err(StoreError::Conflict(format!(
                    "job {job_id} is not {} anymore",
                    transition.expected_from
                )));
            }

            if transition.expected_from != transition.to {
                let state = inner
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
                state.bucket_mut(transition.expected_from).retain(|id| *id != job_id);
                state.bucket_mut(transition.to).push_front(job_id);
            }

            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            job.status = transition.to;
            transition.apply_fields(job);
            job.updates.push(transition.entry.clone());
            job.clone()
        };

        self.publish(StoreEvent {
            event: transition.event,
            queue: queue.to_string(),
            job_id,
            timestamp: transition.timestamp,
        });
        Ok(updated)
    }

    async fn merge_webhooks(
        &self,
        job_id: JobId,
        hooks: &HashMap<String, String>,
    ) -> StoreResult<JobRecord> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.webhooks
            .extend(hooks.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(job.clone())
    }

    async fn job(&self, job_id: JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn jobs_in(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let inner = self.inner.lock();
        let Some(state) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };
        let ids: Vec<JobId> = if status == JobStatus::Delayed {
            let mut delayed = state.delayed.clone();
            delayed.sort_by(|a, b| b.0.cmp(&a.0));
            delayed.into_iter().map(|(_, id)| id).take(limit).collect()
        } else {
            match status {
                JobStatus::Waiting => &state.waiting,
                JobStatus::Active => &state.active,
                JobStatus::Completed => &state.completed,
                JobStatus::Failed => &state.failed,
                JobStatus::Delayed => unreachable!(),
            }
            .iter()
            .take(limit)
            .copied()
            .collect()
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| inner.jobs.get(&id).cloned())
            .collect())
    }

    async fn ids_by_metadata(
        &self,
        application_id: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<Vec<JobId>> {
        Ok(self
            .inner
            .lock()
            .index
            .get(&(
                application_id.to_string(),
                key.to_string(),
                value.to_string(),
            ))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn index_metadata(
        &self,
        application_id: &str,
        job_id: JobId,
        pairs: &[(String, String)],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        for (key, value) in pairs {
            inner
                .index
                .entry((application_id.to_string(), key.clone(), value.clone()))
                .or_default()
                .insert(job_id);
        }
        Ok(())
    }

    async fn pause(&self, queue: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
        state.paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
        state.paused = false;
        Ok(())
    }

    async fn clean(&self, queue: &str, grace_ms: u64, bound: usize) -> StoreResult<u64> {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(i64::try_from(grace_ms).unwrap_or(0));
        let mut removed = 0;
        let mut inner = self.inner.lock();
        let Inner { queues, jobs, .. } = &mut *inner;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        for status in [JobStatus::Completed, JobStatus::Failed] {
            let bucket = state.bucket_mut(status);
            let scanned: Vec<JobId> = bucket.iter().take(bound).copied().collect();
            for id in scanned {
                let old_enough = jobs.get(&id).is_none_or(|job| {
                    let terminal_at = match status {
                        JobStatus::Completed => job.completed_at,
                        _ => job.failed_at,
                    };
                    terminal_at.is_some_and(|at| at < cutoff)
                });
                if old_enough {
                    jobs.remove(&id);
                    state.bucket_mut(status).retain(|other| *other != id);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn stats(&self, queue: &str) -> StoreResult<QueueCounts> {
        let inner = self.inner.lock();
        let state = inner
            .queues
            .get(queue)
            .ok_or_else(|| StoreError::QueueNotFound(queue.to_string()))?;
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
            paused: state.paused,
        })
    }

    async fn schedule_repeatable(&self, queue: &str, spec: &RepeatSpec) -> StoreResult<String> {
        let now = Utc::now();
        let next = spec.next_fire(now).ok_or_else(|| {
            StoreError::Conflict(format!("timer {} has no future fire", spec.key))
        })?;
        let mut inner = self.inner.lock();
        let state = inner.queues.entry(queue.to_string()).or_default();
        state.repeats.insert(
            spec.key.clone(),
            StoredRepeat {
                spec: spec.clone(),
                fired: 0,
                next_ms: next.timestamp_millis(),
            },
        );
        Ok(spec.key.clone())
    }

    async fn schedule_once(&self, queue: &str, spec: &RepeatSpec) -> StoreResult<String> {
        self.schedule_repeatable(queue, spec).await
    }

    async fn cancel_repeatable(&self, queue: &str, handle: &str) -> StoreResult<()> {
        if let Some(state) = self.inner.lock().queues.get_mut(queue) {
            state.repeats.remove(handle);
        }
        Ok(())
    }

    async fn repeat_handles(&self, queue: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .queues
            .get(queue)
            .map(|state| state.repeats.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribe_events(&self, queue: &str) -> StoreResult<EventStream> {
        let rx = self.sender(queue).subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now_ms = now.timestamp_millis();
        let mut promoted = 0;

        // Delayed jobs whose timer fired move to waiting. Their `added`
        // event was published at submit time, so promotion is silent.
        {
            let mut inner = self.inner.lock();
            let Inner { queues, jobs, .. } = &mut *inner;
            for state in queues.values_mut() {
                let (due, rest): (Vec<_>, Vec<_>) =
                    state.delayed.drain(..).partition(|(at, _)| *at <= now_ms);
                state.delayed = rest;
                for (_, id) in due {
                    state.waiting.push_front(id);
                    if let Some(job) = jobs.get_mut(&id) {
                        job.status = JobStatus::Waiting;
                    }
                    promoted += 1;
                }
            }
        }

        // Repeatable timers materialize one job per fire.
        let mut materialized = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (queue, state) in &mut inner.queues {
                let due: Vec<String> = state
                    .repeats
                    .iter()
                    .filter(|(_, repeat)| repeat.next_ms <= now_ms)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    let Some(repeat) = state.repeats.get_mut(&key) else {
                        continue;
                    };
                    let fire_allowed = !repeat.exhausted()
                        && !repeat.spec.end_date.is_some_and(|end| now > end);
                    if fire_allowed {
                        materialized
                            .push(Self::materialize_repeat_job(&repeat.spec, queue, now));
                        repeat.fired += 1;
                    }
                    let next = if repeat.exhausted() {
                        None
                    } else {
                        repeat.spec.next_fire(now)
                    };
                    match next {
                        Some(next) => repeat.next_ms = next.timestamp_millis(),
                        None => {
                            state.repeats.remove(&key);
                        }
                    }
                }
            }
        }
        for job in materialized {
            self.enqueue(&job, None).await?;
            promoted += 1;
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobUpdateEntry;
    use futures_util::StreamExt;
    use serde_json::json;

    fn job(queue: &str, app: &str) -> JobRecord {
        JobRecord {
            id: JobId::new(),
            queue: queue.to_string(),
            application_id: app.to_string(),
            data: json!({"n": 1}),
            metadata: HashMap::new(),
            status: JobStatus::Waiting,
            progress: 0,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            webhooks: HashMap::new(),
            updates: Vec::new(),
        }
    }

    fn started_transition() -> Transition {
        let now = Utc::now();
        Transition {
            expected_from: JobStatus::Waiting,
            to: JobStatus::Active,
            event: StoreEventKind::Active,
            progress: None,
            result: None,
            error: None,
            metadata: None,
            entry: JobUpdateEntry {
                status: "started".to_string(),
                progress: None,
                result: None,
                error: None,
                metadata: None,
                timestamp: now,
            },
            retention_ttl_secs: None,
            timestamp: now,
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_claim_is_fifo() {
        let store = MemoryStore::new();
        store.register_queue("email").await.unwrap();

        let first = job("email", "app_1");
        let second = job("email", "app_1");
        store.enqueue(&first, None).await.unwrap();
        store.enqueue(&second, None).await.unwrap();

        let claimed = store.claim_next("email").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let store = MemoryStore::new();
        store.register_queue("email").await.unwrap();
        store.enqueue(&job("email", "app_1"), None).await.unwrap();

        store.pause("email").await.unwrap();
        assert!(store.claim_next("email").await.unwrap().is_none());
        store.resume("email").await.unwrap();
        assert!(store.claim_next("email").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transition_cas_conflict() {
        let store = MemoryStore::new();
        store.register_queue("email").await.unwrap();
        let record = job("email", "app_1");
        store.enqueue(&record, None).await.unwrap();

        store
            .apply_transition("email", record.id, &started_transition())
            .await
            .unwrap();

        // A second claim of the same job loses the CAS.
        let conflict = store
            .apply_transition("email", record.id, &started_transition())
            .await;
        assert!(matches!(conflict, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_events_flow_through_subscription() {
        let store = MemoryStore::new();
        store.register_queue("email").await.unwrap();
        let mut events = store.subscribe_events("email").await.unwrap();

        let record = job("email", "app_1");
        store.enqueue(&record, None).await.unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.event, StoreEventKind::Added);
        assert_eq!(event.job_id, record.id);
    }

    #[tokio::test]
    async fn test_delayed_promotion() {
        let store = MemoryStore::new();
        store.register_queue("email").await.unwrap();
        let record = job("email", "app_1");
        store.enqueue(&record, Some(10)).await.unwrap();

        assert!(store.claim_next("email").await.unwrap().is_none());
        let promoted = store
            .promote_due(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(promoted, 1);

        let claimed = store.claim_next("email").await.unwrap().unwrap();
        assert_eq!(claimed.id, record.id);
    }

    #[tokio::test]
    async fn test_repeat_timer_fires_and_honors_limit() {
        let store = MemoryStore::new();
        store.register_queue("scheduler").await.unwrap();
        let spec = RepeatSpec {
            key: "schedule:sch_1".to_string(),
            cron: Some("* * * * * *".to_string()),
            timezone: None,
            at: None,
            end_date: None,
            limit: Some(2),
            application_id: "scheduler".to_string(),
            payload: json!({"scheduleId": "sch_1"}),
        };
        store.schedule_repeatable("scheduler", &spec).await.unwrap();

        let mut now = Utc::now();
        let mut fired = 0;
        for _ in 0..5 {
            now += chrono::Duration::seconds(2);
            fired += store.promote_due(now).await.unwrap();
        }
        assert_eq!(fired, 2);
        assert!(store
            .repeat_handles("scheduler")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_metadata_index_lookup() {
        let store = MemoryStore::new();
        store.register_queue("email").await.unwrap();
        let mut record = job("email", "app_1");
        record
            .metadata
            .insert("priority".to_string(), json!("high"));
        store.enqueue(&record, None).await.unwrap();

        let ids = store
            .ids_by_metadata("app_1", "priority", "high")
            .await
            .unwrap();
        assert_eq!(ids, vec![record.id]);
        assert!(store
            .ids_by_metadata("app_2", "priority", "high")
            .await
            .unwrap()
            .is_empty());
    }
}
