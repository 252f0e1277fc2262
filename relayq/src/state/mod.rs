//! Application state.
//!
//! Every service is constructed once at startup with explicit dependencies
//! and shared behind `Arc`s; there are no hidden globals, and tests build
//! the same state over in-memory fakes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::auth::{AuthResolver, KeyAuthResolver};
use crate::config::Config;
use crate::jobs::{EventPump, JobTracker};
use crate::metastore::MetadataStore;
use crate::middleware::RateLimiter;
use crate::queue::QueueManager;
use crate::scheduler::Scheduler;
use crate::shutdown::{InflightTracker, ShutdownToken};
use crate::store::{spawn_promoter, BackingStore};
use crate::subscription::SubscriptionEngine;
use crate::webhook::app_hooks::AppHookDispatcher;
use crate::webhook::job_hooks::JobHookDispatcher;

const PROMOTER_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state behind every request handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<dyn BackingStore>,
    metastore: Arc<dyn MetadataStore>,
    auth_resolver: Arc<dyn AuthResolver>,
    queues: Arc<QueueManager>,
    tracker: Arc<JobTracker>,
    pump: Arc<EventPump>,
    scheduler: Arc<Scheduler>,
    app_hooks: Arc<AppHookDispatcher>,
    subscriptions: Arc<SubscriptionEngine>,
    rate_limiter: RateLimiter,
    shutdown: ShutdownToken,
    inflight: Arc<InflightTracker>,
    started_at: Instant,
}

impl AppState {
    /// Wire every service over the given store implementations.
    #[must_use]
    pub fn build(
        config: Config,
        store: Arc<dyn BackingStore>,
        metastore: Arc<dyn MetadataStore>,
    ) -> Self {
        let shutdown = ShutdownToken::new();
        let inflight = Arc::new(InflightTracker::new());

        let auth_resolver: Arc<dyn AuthResolver> = Arc::new(KeyAuthResolver::new(
            Arc::clone(&metastore),
            config.auth.master_api_key.clone(),
            config.auth.enabled,
        ));

        let queues = Arc::new(QueueManager::new(Arc::clone(&store)));
        let tracker = Arc::new(JobTracker::new(
            Arc::clone(&store),
            Arc::clone(&queues),
            config.retention.clone(),
        ));

        let max_backoff = Duration::from_secs(config.delivery.max_backoff_secs);
        let job_hooks = Arc::new(JobHookDispatcher::new(
            Duration::from_secs(config.delivery.job_webhook_timeout_secs),
            max_backoff,
        ));
        let app_hooks = Arc::new(AppHookDispatcher::new(
            Arc::clone(&metastore),
            Duration::from_secs(config.delivery.app_webhook_timeout_secs),
            max_backoff,
        ));
        let subscriptions = Arc::new(SubscriptionEngine::new(
            Arc::clone(&metastore),
            Duration::from_secs(config.delivery.subscription_timeout_secs),
        ));

        let pump = Arc::new(EventPump::new(
            Arc::clone(&store),
            job_hooks,
            Arc::clone(&app_hooks),
            Arc::clone(&subscriptions),
            Arc::clone(&inflight),
            shutdown.clone(),
        ));
        tracker.set_pump(Arc::clone(&pump));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&metastore),
            Arc::clone(&store),
            shutdown.clone(),
        ));

        let rate_limiter = RateLimiter::new(config.rate_limit.clone());

        Self {
            config: Arc::new(config),
            store,
            metastore,
            auth_resolver,
            queues,
            tracker,
            pump,
            scheduler,
            app_hooks,
            subscriptions,
            rate_limiter,
            shutdown,
            inflight,
            started_at: Instant::now(),
        }
    }

    /// Start background tasks: event pumps for known queues, the due-work
    /// promoter, schedule reconciliation and the scheduler worker.
    pub async fn start_background(&self) {
        self.pump.resume_known_queues().await;
        // Detached tasks; they exit when the shutdown token fires.
        let _promoter = spawn_promoter(
            Arc::clone(&self.store),
            self.shutdown.clone(),
            PROMOTER_INTERVAL,
        );
        if let Err(err) = self.scheduler.reconcile().await {
            tracing::warn!(error = %err, "schedule reconciliation failed");
        }
        self.pump.ensure_queue(crate::scheduler::SCHEDULER_QUEUE).await;
        let _worker = self.scheduler.spawn_worker();
    }

    /// Shut down: refuse new submissions, cancel background tasks and drain
    /// in-flight deliveries for the configured grace period.
    pub async fn graceful_shutdown(&self) {
        info!("shutting down");
        self.tracker.stop_accepting();
        self.shutdown.cancel();
        let grace = Duration::from_secs(self.config.service.shutdown_grace_secs);
        if self.inflight.drain(grace).await {
            info!("all deliveries drained");
        }
    }

    /// Service configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// The metadata store.
    #[must_use]
    pub fn metastore(&self) -> &Arc<dyn MetadataStore> {
        &self.metastore
    }

    /// The auth resolver, for the middleware layer.
    #[must_use]
    pub fn auth_resolver(&self) -> Arc<dyn AuthResolver> {
        Arc::clone(&self.auth_resolver)
    }

    /// The queue manager.
    #[must_use]
    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    /// The job tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// The event pump hub.
    #[must_use]
    pub fn pump(&self) -> &Arc<EventPump> {
        &self.pump
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The application webhook dispatcher.
    #[must_use]
    pub fn app_hooks(&self) -> &Arc<AppHookDispatcher> {
        &self.app_hooks
    }

    /// The subscription engine.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionEngine> {
        &self.subscriptions
    }

    /// The rate limiter, for the middleware layer.
    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        self.rate_limiter.clone()
    }

    /// Seconds since the state was built.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
