//! Background registry monitor.
//!
//! Reaps sandboxes whose hypervisor process died on its own and reports
//! registry metrics at a fixed interval.
//!
//! # Example
//!
//! ```ignore
//! let mut monitor = RegistryMonitor::new(Arc::clone(&manager), Duration::from_secs(5));
//! monitor.start();
//! // ...
//! monitor.shutdown().await;
//! ```

use crate::manager::SandboxManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// ============================================================================
// Statistics
// ============================================================================

/// Names of the counters in [`RegistryStats`], in reporting order.
pub const METRIC_NAMES: [&str; 7] = [
    "sandbox.created",
    "sandbox.create_failed",
    "sandbox.restored",
    "sandbox.deleted",
    "sandbox.reaped",
    "sandbox.purged",
    "sandbox.snapshots",
];

/// Registry counters. All atomic and readable without locking.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub created: AtomicU64,
    pub create_failed: AtomicU64,
    pub restored: AtomicU64,
    pub deleted: AtomicU64,
    pub reaped: AtomicU64,
    pub purged: AtomicU64,
    pub snapshots: AtomicU64,
}

impl RegistryStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    /// Every counter paired with its name from [`METRIC_NAMES`].
    pub fn values(&self) -> [(&'static str, u64); 7] {
        let counters = [
            &self.created,
            &self.create_failed,
            &self.restored,
            &self.deleted,
            &self.reaped,
            &self.purged,
            &self.snapshots,
        ];
        let mut out = [("", 0); 7];
        for (slot, (name, counter)) in out.iter_mut().zip(METRIC_NAMES.iter().zip(counters)) {
            *slot = (*name, counter.load(Ordering::Relaxed));
        }
        out
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Owned background task over a [`SandboxManager`].
///
/// Nothing runs until [`start`](Self::start); [`shutdown`](Self::shutdown)
/// stops the task and waits for it.
pub struct RegistryMonitor {
    manager: Arc<SandboxManager>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryMonitor {
    pub fn new(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            tracing::warn!("Registry monitor already started");
            return;
        }
        let manager = Arc::clone(&self.manager);
        let shutdown = Arc::clone(&self.shutdown);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            Self::monitor_loop(manager, interval, shutdown, shutdown_notify).await;
        }));
        tracing::info!(interval_ms = interval.as_millis() as u64, "Registry monitor started");
    }

    async fn monitor_loop(
        manager: Arc<SandboxManager>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    tracing::debug!("Registry monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let reaped = manager.reap_exited().await;
                    if !reaped.is_empty() {
                        tracing::warn!(count = reaped.len(), sandboxes = ?reaped, "Reaped exited sandboxes");
                    }
                    let live = manager.count().await;
                    let values = manager.stats().values();
                    tracing::debug!(live, metrics = ?values, "Registry metrics");
                }
            }
        }
        tracing::debug!("Registry monitor exited");
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Registry monitor panicked");
            }
        }
        tracing::info!("Registry monitor stopped");
    }
}
