use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct RegistryInner {
    handles: HashMap<Uuid, JoinHandle<()>>,
}

/// Tracks the background task of every running job. Entries remove
/// themselves when their task ends, including on panic, so
/// [`JobRegistry::wait_all`] can be used for graceful shutdown.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    active: Arc<watch::Sender<usize>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the registry entry when the task future is dropped, whether it
/// finished, panicked or was aborted.
struct Deregister {
    registry: JobRegistry,
    job_id: Uuid,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.remove(self.job_id);
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            active: Arc::new(active),
        }
    }

    /// Spawn `task` for `job_id` unless that job already has a live task.
    /// Returns false if it was already running.
    pub fn spawn<F>(&self, job_id: Uuid, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.handles.contains_key(&job_id) {
            debug!("Job {} already has a running task", job_id);
            return false;
        }

        let guard = Deregister {
            registry: self.clone(),
            job_id,
        };
        // The entry is inserted before the lock is released, so the task's
        // own removal can never run ahead of the insert.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
        inner.handles.insert(job_id, handle);
        self.active.send_replace(inner.handles.len());
        true
    }

    fn remove(&self, job_id: Uuid) {
        let mut inner = self.inner.lock();
        if inner.handles.remove(&job_id).is_some() {
            self.active.send_replace(inner.handles.len());
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.inner.lock().handles.contains_key(&job_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// Wait until every registered task has ended.
    pub async fn wait_all(&self) {
        let mut rx = self.active.subscribe();
        let pending = *rx.borrow();
        if pending > 0 {
            info!("⏳ Waiting for {} running job(s) to finish", pending);
        }
        // Sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}
