//! Work signaling and shutdown plumbing.
//!
//! The store notifies the context whenever local data changes; the
//! controller parks on [`WorkContext::wait_for_work`] between ticks and is
//! woken early by those notifications. Shutdown is a watch channel shared
//! with every in-flight worker so HTTP calls can observe cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Shared work/shutdown context.
///
/// One instance lives for the process lifetime and is cloned by `Arc`
/// into the controller, workers, and the heartbeat handler.
pub struct WorkContext {
    /// Pending-work signal. A permit is stored, so a notification that
    /// arrives while the controller is mid-tick is not lost.
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Counts work notifications, for diagnostics.
    work_counter: AtomicU64,
    /// Set by workers that shipped something this tick.
    found_work: AtomicBool,
}

impl WorkContext {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            notify: Notify::new(),
            shutdown_tx,
            shutdown_rx,
            work_counter: AtomicU64::new(0),
            found_work: AtomicBool::new(false),
        }
    }

    /// Signal that local data changed and replication may have work.
    pub fn notify_about_work(&self) {
        self.work_counter.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Called by a worker after it successfully shipped documents or
    /// attachments, so an idling store wakes up.
    pub fn update_found_work(&self) {
        self.found_work.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Whether any worker reported progress since the last
    /// [`take_found_work`](Self::take_found_work).
    pub fn take_found_work(&self) -> bool {
        self.found_work.swap(false, Ordering::Relaxed)
    }

    /// Number of work notifications received so far.
    pub fn work_count(&self) -> u64 {
        self.work_counter.load(Ordering::Relaxed)
    }

    /// Park until a work notification, the timeout, or shutdown.
    ///
    /// Returns `true` only when the wake was work-triggered. The `name`
    /// identifies the waiter in logs.
    pub async fn wait_for_work(&self, timeout: Duration, name: &str) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = self.notify.notified() => {
                debug!(waiter = name, "Woken by work notification");
                true
            }
            _ = tokio::time::sleep(timeout) => false,
            _ = shutdown_rx.changed() => false,
        }
    }

    /// Signal shutdown to everything holding a receiver.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        // Release any parked waiter so it can observe the flag
        self.notify.notify_one();
    }

    /// True once shutdown was signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// A receiver for select-based cancellation in workers and transports.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

impl Default for WorkContext {
    fn default() -> Self {
        Self::new()
    }
}
