//! Background reachability prober.
//!
//! One prober exists per role. It is started on demand when a node fails to open, repeatedly
//! tries every node flagged unreachable, and exits once none remain. Passes are spaced by a
//! [`ProbeBackoff`] that a network transition resets.

use async_trait::async_trait;
use dirsearch_core::backoff::ProbeBackoff;
use dirsearch_core::types::SearchRole;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Result of one probe pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeOutcome {
    /// Nodes attempted.
    pub probed: usize,
    /// Nodes that opened successfully.
    pub recovered: usize,
    /// Nodes still unreachable after the pass.
    pub remaining: usize,
}

/// What a prober probes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    /// Tries every unreachable node once.
    async fn probe_pass(&self) -> ProbeOutcome;

    /// Number of nodes currently flagged unreachable.
    fn unreachable_count(&self) -> usize;
}

/// Per-role prober state.
pub struct ReachabilityProber {
    role: SearchRole,
    active: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
    backoff: Mutex<ProbeBackoff>,
    passes: watch::Sender<u64>,
}

impl ReachabilityProber {
    /// Creates an idle prober.
    #[must_use]
    pub fn new(role: SearchRole, backoff: ProbeBackoff) -> Self {
        let (passes, _) = watch::channel(0);
        Self {
            role,
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            backoff: Mutex::new(backoff),
            passes,
        }
    }

    /// Starts the background task unless one is already running.
    ///
    /// Returns true if a task was started. Outside a tokio runtime nothing is started.
    pub fn ensure_running(self: &Arc<Self>, target: &Arc<dyn ProbeTarget>) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let Ok(handle) = Handle::try_current() else {
            self.active.store(false, Ordering::Release);
            warn!(role = %self.role, "no async runtime, reachability prober not started");
            return false;
        };

        info!(role = %self.role, "starting reachability prober");
        let prober = Arc::clone(self);
        let target = Arc::downgrade(target);
        handle.spawn(async move { prober.run(target).await });
        true
    }

    async fn run(self: Arc<Self>, target: Weak<dyn ProbeTarget>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let Some(strong) = target.upgrade() else {
                break;
            };
            let outcome = strong.probe_pass().await;
            drop(strong);
            self.passes.send_modify(|count| *count += 1);
            debug!(
                role = %self.role,
                probed = outcome.probed,
                recovered = outcome.recovered,
                remaining = outcome.remaining,
                "probe pass complete"
            );

            if outcome.remaining > 0 {
                let delay = self.lock_backoff().record_pass(outcome.recovered == 0);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.wake.notified() => {}
                }
                continue;
            }

            self.active.store(false, Ordering::Release);
            // a node may have failed after the pass finished
            let pending = target
                .upgrade()
                .map_or(0, |strong| strong.unreachable_count());
            if pending == 0
                || self.stopped.load(Ordering::Acquire)
                || self
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                self.lock_backoff().reset();
                info!(role = %self.role, "all nodes reachable, prober idle");
                return;
            }
        }
        self.active.store(false, Ordering::Release);
        debug!(role = %self.role, "reachability prober stopped");
    }

    /// Resets the backoff and wakes a sleeping pass.
    pub fn network_transition(&self) {
        self.lock_backoff().reset();
        // an idle prober must not keep the wake-up for its next run
        if self.is_active() {
            self.wake.notify_one();
        }
    }

    /// Stops the prober for good.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Returns true while a background task is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of passes completed so far.
    #[must_use]
    pub fn passes_completed(&self) -> u64 {
        *self.passes.borrow()
    }

    /// Subscribes to the pass counter.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.passes.subscribe()
    }

    /// Current delay between failed passes.
    #[must_use]
    pub fn current_backoff(&self) -> Duration {
        self.lock_backoff().current()
    }

    /// Waits until more than `after` passes have completed.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_pass(&self, after: u64, timeout: Duration) -> bool {
        let mut passes = self.subscribe();
        matches!(
            tokio::time::timeout(timeout, async {
                passes.wait_for(|count| *count > after).await.is_ok()
            })
            .await,
            Ok(true)
        )
    }

    fn lock_backoff(&self) -> MutexGuard<'_, ProbeBackoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
