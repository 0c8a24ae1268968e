use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal — cooperative shutdown for run tasks
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator for active generation runs.
///
/// Run tasks check [`is_shutting_down`] at every safepoint (between phases,
/// scenes, beats, and around LLM calls) and park when it flips. The engine
/// triggers shutdown, waits a bounded time for each run to confirm it has
/// reached a safe point, then snapshots whatever state exists; still
/// in-flight LLM calls are abandoned.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let guard = ParkGuard::new(shutdown.clone());
/// tokio::select! {
///     _ = shutdown.subscribe().recv() => { /* park and snapshot */ }
///     _ = drive_run() => {}
/// }
/// drop(guard); // confirms this run parked
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    parked_tx: Arc<watch::Sender<usize>>,
    parked_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (parked_tx, parked_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            parked_tx: Arc::new(parked_tx),
            parked_rx,
        }
    }

    /// Subscribe to the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Cheap non-blocking poll used at safepoints.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Confirm that one run task has reached a safe point and stopped.
    pub fn confirm_parked(&self) {
        self.parked_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` run tasks to park, bounded by `timeout`.
    pub async fn wait_for_park(&mut self, expected: usize, timeout: Duration) -> ParkResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *self.parked_rx.borrow();
            if current >= expected {
                info!(count = current, "all runs parked");
                return ParkResult::Complete(current);
            }

            match tokio::time::timeout_at(deadline, self.parked_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    let current = *self.parked_rx.borrow();
                    return ParkResult::Complete(current);
                }
                Err(_) => {
                    let current = *self.parked_rx.borrow();
                    warn!(current, expected, "park timeout — abandoning in-flight work");
                    return ParkResult::Timeout {
                        parked: current,
                        expected,
                    };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ParkResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkResult {
    /// All expected runs confirmed they parked.
    Complete(usize),
    /// Timeout expired first; the remainder will be snapshotted as-is.
    Timeout { parked: usize, expected: usize },
}

impl ParkResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, ParkResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ParkGuard — RAII guard that confirms parking on drop
// ---------------------------------------------------------------------------

/// Confirms a run parked when dropped. One per run task.
pub struct ParkGuard {
    signal: ShutdownSignal,
}

impl ParkGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        self.signal.confirm_parked();
    }
}

// ---------------------------------------------------------------------------
// StopToken — per-run safepoint flag
// ---------------------------------------------------------------------------

/// What a run task consults at every safepoint (between phases, scenes,
/// beats, writer/critic iterations, and around LLM calls).
///
/// Combines the run-local pause/cancel flags with the process-wide
/// shutdown signal. Pause and shutdown park the run so it can resume or be
/// snapshotted; cancel is final.
#[derive(Debug, Clone)]
pub struct StopToken {
    shutdown: ShutdownSignal,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.is_paused() || self.is_cancelled() || self.shutdown.is_shutting_down()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_token_combines_all_sources() {
        let signal = ShutdownSignal::new();
        let token = StopToken::new(signal.clone());
        assert!(!token.should_stop());

        token.set_paused(true);
        assert!(token.should_stop());
        token.set_paused(false);
        assert!(!token.should_stop());

        token.cancel();
        assert!(token.should_stop());

        let fresh = StopToken::new(signal.clone());
        signal.trigger();
        assert!(fresh.should_stop());
    }

    #[test]
    fn new_signal_is_not_shutting_down() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
    }

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn clone_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_receive_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn park_completes_when_all_guards_drop() {
        let mut signal = ShutdownSignal::new();
        let guard1 = ParkGuard::new(signal.clone());
        let guard2 = ParkGuard::new(signal.clone());

        signal.trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard1);
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard2);
        });

        let result = signal.wait_for_park(2, Duration::from_secs(1)).await;
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn park_times_out_when_a_run_hangs() {
        let mut signal = ShutdownSignal::new();
        let _held = ParkGuard::new(signal.clone());

        signal.trigger();
        let result = signal.wait_for_park(2, Duration::from_millis(50)).await;
        assert_eq!(
            result,
            ParkResult::Timeout {
                parked: 0,
                expected: 2
            }
        );
    }
}
