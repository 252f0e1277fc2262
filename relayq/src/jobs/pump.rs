//! Per-queue event pumps.
//!
//! One task per materialized queue consumes the store's event stream and
//! fans each transition out to the three delivery sinks (per-job webhooks,
//! application webhooks, subscriptions). Delivery tasks are independent and
//! unordered across sinks; per job the stream itself is ordered because
//! updates are serialized before publishing.
//!
//! A pump's subscription is restartable: when the stream ends or errors the
//! pump waits briefly and resubscribes, until shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::shutdown::{InflightTracker, ShutdownToken};
use crate::store::{BackingStore, StoreEvent};
use crate::subscription::SubscriptionEngine;
use crate::webhook::app_hooks::AppHookDispatcher;
use crate::webhook::job_hooks::JobHookDispatcher;

use super::JobEvent;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Spawns and tracks the per-queue fan-out tasks.
pub struct EventPump {
    store: Arc<dyn BackingStore>,
    job_hooks: Arc<JobHookDispatcher>,
    app_hooks: Arc<AppHookDispatcher>,
    subscriptions: Arc<SubscriptionEngine>,
    inflight: Arc<InflightTracker>,
    shutdown: ShutdownToken,
    running: Mutex<HashSet<String>>,
}

impl EventPump {
    /// Create the pump hub.
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        job_hooks: Arc<JobHookDispatcher>,
        app_hooks: Arc<AppHookDispatcher>,
        subscriptions: Arc<SubscriptionEngine>,
        inflight: Arc<InflightTracker>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            job_hooks,
            app_hooks,
            subscriptions,
            inflight,
            shutdown,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Start a pump for `queue` unless one is already running.
    ///
    /// The initial subscription is established before this returns, so an
    /// event published right after is already covered.
    pub async fn ensure_queue(self: &Arc<Self>, queue: &str) {
        {
            let mut running = self.running.lock();
            if !running.insert(queue.to_string()) {
                return;
            }
        }
        let initial = match self.store.subscribe_events(queue).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(queue = %queue, error = %err, "event subscription failed, will retry");
                None
            }
        };
        let pump = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            pump.run(queue, initial).await;
        });
    }

    /// Start pumps for every already-materialized queue (startup).
    pub async fn resume_known_queues(self: &Arc<Self>) {
        match self.store.queues().await {
            Ok(queues) => {
                for queue in queues {
                    self.ensure_queue(&queue).await;
                }
            }
            Err(err) => warn!(error = %err, "could not list queues for event pumps"),
        }
    }

    async fn run(self: Arc<Self>, queue: String, initial: Option<crate::store::EventStream>) {
        debug!(queue = %queue, "event pump started");
        let mut next_stream = initial;
        while !self.shutdown.is_cancelled() {
            let stream = match next_stream.take() {
                Some(stream) => Some(stream),
                None => match self.store.subscribe_events(&queue).await {
                    Ok(stream) => Some(stream),
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "event subscription failed");
                        None
                    }
                },
            };

            if let Some(mut events) = stream {
                loop {
                    tokio::select! {
                        () = self.shutdown.cancelled() => {
                            debug!(queue = %queue, "event pump stopping");
                            return;
                        }
                        event = events.next() => match event {
                            Some(event) => self.handle(event).await,
                            None => break,
                        }
                    }
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    async fn handle(&self, event: StoreEvent) {
        let job = match self.store.job(event.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Purged before fan-out caught up; nothing to deliver.
                return;
            }
            Err(err) => {
                warn!(job_id = %event.job_id, error = %err, "could not load job for fan-out");
                return;
            }
        };

        let job_event = JobEvent {
            kind: event.event.as_job_event(),
            job,
            timestamp: event.timestamp,
        };

        // Independent tasks per sink; none of them can block the others.
        let hooks = Arc::clone(&self.job_hooks);
        let guard = self.inflight.start();
        let cloned = job_event.clone();
        tokio::spawn(async move {
            let _guard = guard;
            hooks.dispatch(&cloned).await;
        });

        let hooks = Arc::clone(&self.app_hooks);
        let guard = self.inflight.start();
        let cloned = job_event.clone();
        tokio::spawn(async move {
            let _guard = guard;
            hooks.dispatch(&cloned).await;
        });

        let subscriptions = Arc::clone(&self.subscriptions);
        let guard = self.inflight.start();
        tokio::spawn(async move {
            let _guard = guard;
            subscriptions.dispatch(&job_event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::memory::MemoryMetadataStore;
    use crate::testing::MemoryStore;

    fn pump(store: Arc<dyn BackingStore>) -> Arc<EventPump> {
        let metastore = Arc::new(MemoryMetadataStore::new());
        Arc::new(EventPump::new(
            store,
            Arc::new(JobHookDispatcher::new(
                Duration::from_secs(5),
                Duration::from_secs(60),
            )),
            Arc::new(AppHookDispatcher::new(
                metastore.clone(),
                Duration::from_secs(30),
                Duration::from_secs(60),
            )),
            Arc::new(SubscriptionEngine::new(metastore, Duration::from_secs(30))),
            Arc::new(InflightTracker::new()),
            ShutdownToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_ensure_queue_is_idempotent() {
        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
        store.register_queue("email").await.unwrap();
        let pump = pump(store);

        pump.ensure_queue("email").await;
        pump.ensure_queue("email").await;
        assert_eq!(pump.running.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_known_queues_covers_existing() {
        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
        store.register_queue("email").await.unwrap();
        store.register_queue("reports").await.unwrap();
        let pump = pump(store);

        pump.resume_known_queues().await;
        assert_eq!(pump.running.lock().len(), 2);
    }
}
