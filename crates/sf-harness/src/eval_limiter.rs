//! Shared concurrency limiter for fire-and-forget evaluation tasks.
//!
//! Relevance and faithfulness evaluators run off the generation critical
//! path; they share one counting semaphore (default 3 permits) with FIFO
//! acquisition, so a burst of evaluations queues instead of contending with
//! drafting for provider capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Clone)]
pub struct EvaluationLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl EvaluationLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn an evaluation task. Returns immediately; the task waits its
    /// turn on the semaphore inside the spawned future, so the caller is
    /// never blocked by evaluation backpressure.
    pub fn spawn<F>(&self, label: &'static str, task: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            // Acquire fails only when the semaphore is closed, which we
            // never do; treat it as a skipped evaluation.
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            in_flight.fetch_add(1, Ordering::SeqCst);
            debug!(label, "evaluation started");
            task.await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            debug!(label, "evaluation finished");
        })
    }

    /// Evaluations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn caps_concurrent_evaluations() {
        let limiter = EvaluationLimiter::new(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter_ref = limiter.clone();
            let peak_ref = peak.clone();
            handles.push(limiter.spawn("test", async move {
                let now = limiter_ref.in_flight();
                peak_ref.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn spawn_returns_without_waiting() {
        let limiter = EvaluationLimiter::new(1);
        // Hold the only permit.
        let _slow = limiter.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let start = std::time::Instant::now();
        let _queued = limiter.spawn("queued", async {});
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
