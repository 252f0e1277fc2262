//! Queue registry, authorization and admin operations.
//!
//! Queues materialize lazily on first use and are never destroyed. The
//! namespace is flat and shared across applications: two tenants that both
//! submit to `email` share one FIFO, and isolation comes from the
//! `application_id` tag on every job, enforced on the read and update
//! paths.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::auth::AuthContext;
use crate::error::{ApiError, ErrorCode};
use crate::store::{BackingStore, QueueCounts};

/// Upper bound on terminal jobs scanned per bucket during a clean pass.
const CLEAN_SCAN_BOUND: usize = 1_000;

/// Routes requests to queues and owns the admin surface.
pub struct QueueManager {
    store: Arc<dyn BackingStore>,
}

impl QueueManager {
    /// Create a manager over the backing store.
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Idempotently materialize a queue.
    ///
    /// # Errors
    ///
    /// `VALIDATION_ERROR` on an empty name; store errors map per taxonomy.
    pub async fn materialize(&self, name: &str) -> Result<(), ApiError> {
        if name.trim().is_empty() {
            return Err(ApiError::validation("queue name must not be empty"));
        }
        self.store.register_queue(name).await?;
        Ok(())
    }

    /// Check that `auth` may use `name`.
    ///
    /// # Errors
    ///
    /// `QUEUE_ACCESS_DENIED` when the application's grants do not cover the
    /// queue.
    pub fn authorize(&self, auth: &AuthContext, name: &str) -> Result<(), ApiError> {
        if auth.allows_queue(name) {
            Ok(())
        } else {
            Err(ApiError::new(
                ErrorCode::QueueAccessDenied,
                format!(
                    "application {} may not use queue {name}",
                    auth.application_id
                ),
            )
            .with_fix("ask the operator to add the queue to the application's allowedQueues"))
        }
    }

    fn require_master(auth: &AuthContext, operation: &str) -> Result<(), ApiError> {
        if auth.is_master {
            Ok(())
        } else {
            Err(ApiError::new(
                ErrorCode::PermissionDenied,
                format!("{operation} requires the master api key"),
            ))
        }
    }

    /// Pause claiming on a queue. Master only.
    pub async fn pause(&self, auth: &AuthContext, name: &str) -> Result<(), ApiError> {
        Self::require_master(auth, "pausing a queue")?;
        self.ensure_known(name).await?;
        self.store.pause(name).await?;
        info!(queue = %name, "queue paused");
        Ok(())
    }

    /// Resume claiming on a queue. Master only.
    pub async fn resume(&self, auth: &AuthContext, name: &str) -> Result<(), ApiError> {
        Self::require_master(auth, "resuming a queue")?;
        self.ensure_known(name).await?;
        self.store.resume(name).await?;
        info!(queue = %name, "queue resumed");
        Ok(())
    }

    /// Remove terminal jobs older than `grace_ms`. Master only. Returns the
    /// number of jobs removed.
    pub async fn clean(
        &self,
        auth: &AuthContext,
        name: &str,
        grace_ms: u64,
    ) -> Result<u64, ApiError> {
        Self::require_master(auth, "cleaning a queue")?;
        self.ensure_known(name).await?;
        let removed = self.store.clean(name, grace_ms, CLEAN_SCAN_BOUND).await?;
        info!(queue = %name, removed, "queue cleaned");
        Ok(removed)
    }

    /// Counters for one queue, subject to the caller's queue grants.
    pub async fn stats(&self, auth: &AuthContext, name: &str) -> Result<QueueCounts, ApiError> {
        self.authorize(auth, name)?;
        self.ensure_known(name).await?;
        Ok(self.store.stats(name).await?)
    }

    /// Counters for every queue visible to the caller.
    pub async fn stats_all(
        &self,
        auth: &AuthContext,
    ) -> Result<HashMap<String, QueueCounts>, ApiError> {
        let mut all = HashMap::new();
        for queue in self.list(auth).await? {
            let counts = self.store.stats(&queue).await?;
            all.insert(queue, counts);
        }
        Ok(all)
    }

    /// Registered queues visible to the caller.
    pub async fn list(&self, auth: &AuthContext) -> Result<Vec<String>, ApiError> {
        let queues = self.store.queues().await?;
        Ok(queues
            .into_iter()
            .filter(|queue| auth.allows_queue(queue))
            .collect())
    }

    async fn ensure_known(&self, name: &str) -> Result<(), ApiError> {
        let queues = self.store.queues().await?;
        if queues.iter().any(|queue| queue == name) {
            Ok(())
        } else {
            Err(ApiError::new(
                ErrorCode::QueueNotFound,
                format!("queue {name} has never been used"),
            ))
        }
    }
}
