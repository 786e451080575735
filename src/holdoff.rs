//! Change coalescing between the object store and the compiler.
//!
//! Watch events arrive in bursts (a rollout touches endpoints, pods and
//! services within milliseconds of each other). Recompiling the graph on
//! every event would thrash the proxies, so mutations signal a
//! [`HoldoffNotifier`] instead and a single worker drains the signal after
//! a short quiet period, folding any burst into one rebuild.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Edge-triggered rebuild signal with single-pending semantics.
///
/// `Notify::notify_one` stores at most one permit, so any number of
/// notifications between rebuilds collapse into a single wakeup. Cloning
/// shares the underlying signal.
#[derive(Clone, Default)]
pub struct HoldoffNotifier {
    signal: Arc<Notify>,
}

impl HoldoffNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the source data changed. Cheap, non-blocking, safe to
    /// call from any task.
    pub fn notify(&self) {
        self.signal.notify_one();
    }

    /// Spawn the drain loop: wait for a signal, sleep out the holdoff
    /// window, then run `rebuild`. A signal raised during the window or
    /// during the rebuild leaves a permit behind, which runs exactly one
    /// queued rebuild straight after the current one finishes; only a
    /// fully quiet worker waits out a new window.
    pub fn spawn_worker<F>(&self, holdoff: Duration, mut rebuild: F) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::clone(&self.signal);
        tokio::spawn(async move {
            loop {
                signal.notified().await;
                tokio::time::sleep(holdoff).await;
                debug!(holdoff_ms = holdoff.as_millis() as u64, "Holdoff expired, rebuilding");
                loop {
                    rebuild();
                    // A stored permit means changes arrived mid-rebuild
                    // (or mid-window); drain it now instead of sleeping
                    // out another window.
                    let queued = tokio::select! {
                        biased;
                        _ = signal.notified() => true,
                        _ = std::future::ready(()) => false,
                    };
                    if !queued {
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn burst_of_notifications_coalesces_into_one_rebuild() {
        let notifier = HoldoffNotifier::new();
        let rebuilds = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&rebuilds);
        let worker = notifier.spawn_worker(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..50 {
            notifier.notify();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_holdoff_window_is_not_lost() {
        let notifier = HoldoffNotifier::new();
        let rebuilds = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&rebuilds);
        let worker = notifier.spawn_worker(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Raised mid-window: drained as one queued rebuild right behind
        // the first, with no second window in between.
        notifier.notify();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(rebuilds.load(Ordering::SeqCst), 2);

        // Nothing further is pending.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rebuilds.load(Ordering::SeqCst), 2);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_rebuild_runs_queued_pass_immediately() {
        let notifier = HoldoffNotifier::new();
        let rebuilds = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&rebuilds);
        let echo = notifier.clone();
        let worker = notifier.spawn_worker(Duration::from_millis(100), move || {
            // The first rebuild observes a change landing mid-run.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                echo.notify();
            }
        });

        notifier.notify();
        // One window elapses; the queued pass must not wait out another.
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(rebuilds.load(Ordering::SeqCst), 2);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_notifier_never_rebuilds() {
        let notifier = HoldoffNotifier::new();
        let rebuilds = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&rebuilds);
        let worker = notifier.spawn_worker(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rebuilds.load(Ordering::SeqCst), 0);
        worker.abort();
    }
}
