//! Cancellation registry for running jobs.
//!
//! A job is present here only while a worker is processing it. Each entry
//! pairs the job's cancellation token with its transition gate: the lock
//! under which stage transitions are written. Holding the gate while
//! writing Canceled is what keeps a cancel from interleaving with the
//! processor's own transitions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Transition bookkeeping shared by the processor and `cancel_job`.
#[derive(Debug)]
pub struct GateState {
    open: bool,
    progress: f64,
}

impl GateState {
    /// False once a terminal stage has been written.
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    /// Progress of the last written transition.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn set_progress(&mut self, progress: f64) {
        self.progress = progress;
    }
}

/// Cancellation handle of one running job.
#[derive(Debug, Clone)]
pub struct ActiveHandle {
    token: CancellationToken,
    gate: Arc<tokio::sync::Mutex<GateState>>,
}

impl ActiveHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            gate: Arc::new(tokio::sync::Mutex::new(GateState {
                open: true,
                progress: 0.0,
            })),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Locks the transition gate.
    pub async fn gate(&self) -> tokio::sync::MutexGuard<'_, GateState> {
        self.gate.lock().await
    }

    fn same_as(&self, other: &ActiveHandle) -> bool {
        Arc::ptr_eq(&self.gate, &other.gate)
    }
}

impl Default for ActiveHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrency-safe map from job id to [`ActiveHandle`].
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    active: Mutex<HashMap<String, ActiveHandle>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh handle for `job_id`, or returns `None` when the
    /// job is already running. The entry is removed when the returned guard
    /// drops.
    pub fn try_register(self: &Arc<Self>, job_id: &str) -> Option<ActiveGuard> {
        let handle = ActiveHandle::new();
        {
            let mut active = self.active.lock();
            if active.contains_key(job_id) {
                return None;
            }
            active.insert(job_id.to_string(), handle.clone());
        }
        Some(ActiveGuard {
            registry: Arc::clone(self),
            job_id: job_id.to_string(),
            handle,
        })
    }

    /// Removes and returns the handle of `job_id`, if the job is running.
    pub fn take(&self, job_id: &str) -> Option<ActiveHandle> {
        self.active.lock().remove(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.active.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }
}

/// Registration of one running job; unregisters on drop.
pub struct ActiveGuard {
    registry: Arc<CancellationRegistry>,
    job_id: String,
    handle: ActiveHandle,
}

impl ActiveGuard {
    pub fn handle(&self) -> &ActiveHandle {
        &self.handle
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.registry.active.lock();
        // A cancel may already have taken the entry
        if active
            .get(&self.job_id)
            .is_some_and(|current| current.same_as(&self.handle))
        {
            active.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(CancellationRegistry::new());
        {
            let guard = registry.try_register("job-1").unwrap();
            assert!(registry.contains("job-1"));
            assert!(registry.try_register("job-1").is_none());
            assert!(!guard.handle().is_canceled());
        }
        assert!(!registry.contains("job-1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_take_removes_entry_once() {
        let registry = Arc::new(CancellationRegistry::new());
        let guard = registry.try_register("job-1").unwrap();

        let handle = registry.take("job-1").expect("registered");
        handle.token().cancel();
        assert!(guard.handle().is_canceled());
        assert!(registry.take("job-1").is_none());

        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_guard_does_not_remove_newer_registration() {
        let registry = Arc::new(CancellationRegistry::new());
        let old = registry.try_register("job-1").unwrap();
        let _ = registry.take("job-1");
        let _new = registry.try_register("job-1").unwrap();

        drop(old);
        assert!(registry.contains("job-1"));
        assert_eq!(registry.active_ids(), vec!["job-1".to_string()]);
    }

    #[tokio::test]
    async fn test_gate_tracks_progress_and_closes() {
        let handle = ActiveHandle::new();
        {
            let mut gate = handle.gate().await;
            assert!(gate.is_open());
            gate.set_progress(42.0);
            gate.close();
        }
        let clone = handle.clone();
        let gate = clone.gate().await;
        assert!(!gate.is_open());
        assert_eq!(gate.progress(), 42.0);
    }
}
