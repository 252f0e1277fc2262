//! Graceful shutdown coordination.
//!
//! A [`ShutdownToken`] is cloned into every background task (event pumps,
//! the due-work promoter, the scheduler worker, delivery tasks). On
//! shutdown the control plane stops accepting submissions, the token is
//! cancelled, and [`InflightTracker::drain`] waits a bounded grace period
//! for outstanding deliveries before the process exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

/// Cooperative cancellation token backed by a watch channel.
///
/// Tasks either poll [`ShutdownToken::is_cancelled`] between units of work
/// or `select!` on [`ShutdownToken::cancelled`].
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Create a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Request cancellation. Signals every clone of this token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
        debug!("shutdown requested");
    }

    /// Wait until cancellation is requested. Returns immediately if the
    /// token is already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts in-flight delivery tasks so shutdown can drain them.
#[derive(Debug, Default)]
pub struct InflightTracker {
    count: AtomicUsize,
}

impl InflightTracker {
    /// Create a tracker with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of in-flight work. The guard decrements on drop.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Number of tasks currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for in-flight work to finish, up to `grace`.
    ///
    /// Returns `true` when everything drained, `false` when the grace
    /// period expired with work still outstanding.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.in_flight();
            if remaining == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "shutdown grace period expired with deliveries in flight");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// RAII guard for one in-flight unit of work.
#[derive(Debug)]
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_cancel_propagates_to_clones() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();
        handle.await.expect("waiter should finish");
    }

    #[tokio::test]
    async fn test_drain_completes_when_guards_drop() {
        let tracker = Arc::new(InflightTracker::new());
        let guard = tracker.start();
        assert_eq!(tracker.in_flight(), 1);

        let drainer = Arc::clone(&tracker);
        let handle =
            tokio::spawn(async move { drainer.drain(Duration::from_secs(5)).await });

        drop(guard);
        assert!(handle.await.expect("drain task"));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_times_out_with_work_outstanding() {
        let tracker = Arc::new(InflightTracker::new());
        let _guard = tracker.start();
        assert!(!tracker.drain(Duration::from_millis(60)).await);
    }
}
