use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sf_core::types::{GenerationRun, RunStatus};
use sf_harness::shutdown::StopToken;
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Shared handle to one run. The owning run task is the only mutator of the
/// state; everyone else reads through [`RunHandle::status`].
pub struct RunHandle {
    pub run: Arc<RwLock<GenerationRun>>,
    pub token: StopToken,
    running: AtomicBool,
}

impl RunHandle {
    pub fn new(run: GenerationRun, token: StopToken) -> Self {
        Self {
            run: Arc::new(RwLock::new(run)),
            token,
            running: AtomicBool::new(false),
        }
    }

    pub async fn status(&self) -> RunStatus {
        self.run.read().await.status()
    }

    /// Whether a drive task currently owns this run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// RunRegistry
// ---------------------------------------------------------------------------

/// Concurrent map of active runs.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<Uuid, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run_id: Uuid, handle: Arc<RunHandle>) {
        self.runs.insert(run_id, handle);
    }

    pub fn get(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.get(&run_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.remove(&run_id).map(|(_, handle)| handle)
    }

    pub fn handles(&self) -> Vec<Arc<RunHandle>> {
        self.runs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn statuses(&self) -> Vec<RunStatus> {
        let mut out = Vec::new();
        for handle in self.handles() {
            out.push(handle.status().await);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
