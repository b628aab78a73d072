use crate::errors::StateStoreError;
use crate::models::JobSnapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Matches the `JOB_STATE_TTL_SECS` default
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Fast key-value view of job progress, read by status polling before the
/// repository. Cancellation is kept beside the snapshot so progress writes
/// never clear a pending cancel.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Snapshot with `cancel_requested` merged in
    async fn get(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, StateStoreError>;

    async fn set(&self, snapshot: &JobSnapshot) -> Result<(), StateStoreError>;

    /// Raise the cancel flag. Returns false when no snapshot exists.
    async fn cancel(&self, job_id: Uuid) -> Result<bool, StateStoreError>;

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, StateStoreError>;

    async fn clear_cancel(&self, job_id: Uuid) -> Result<(), StateStoreError>;

    async fn remove(&self, job_id: Uuid) -> Result<(), StateStoreError>;

    /// Drop expired snapshots and flags. Backends with native expiry have
    /// nothing to do.
    async fn purge_expired(&self) -> Result<usize, StateStoreError> {
        Ok(0)
    }
}

#[derive(Clone)]
struct StoredSnapshot {
    snapshot: JobSnapshot,
    expires_at: Instant,
}

/// Process-local store. Snapshots and cancel flags expire `ttl` after their
/// last write, like keys in the Redis backend.
#[derive(Clone)]
pub struct InMemoryJobStateStore {
    snapshots: Arc<DashMap<Uuid, StoredSnapshot>>,
    cancelled: Arc<DashMap<Uuid, Instant>>,
    ttl: Duration,
}

impl Default for InMemoryJobStateStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_STATE_TTL)
    }
}

impl InMemoryJobStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            snapshots: Arc::new(DashMap::new()),
            cancelled: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn expire(&self, job_id: Uuid, now: Instant) {
        self.snapshots.remove_if(&job_id, |_, stored| stored.expires_at <= now);
        self.cancelled.remove_if(&job_id, |_, expires_at| *expires_at <= now);
    }
}

#[async_trait]
impl JobStateStore for InMemoryJobStateStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, StateStoreError> {
        self.expire(job_id, Instant::now());
        let snapshot = self.snapshots.get(&job_id).map(|entry| entry.snapshot.clone());
        Ok(snapshot.map(|mut snapshot| {
            snapshot.cancel_requested = self.cancelled.contains_key(&job_id);
            snapshot
        }))
    }

    async fn set(&self, snapshot: &JobSnapshot) -> Result<(), StateStoreError> {
        self.snapshots.insert(
            snapshot.job_id,
            StoredSnapshot {
                snapshot: snapshot.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, StateStoreError> {
        let now = Instant::now();
        self.expire(job_id, now);
        if !self.snapshots.contains_key(&job_id) {
            return Ok(false);
        }
        self.cancelled.insert(job_id, now + self.ttl);
        Ok(true)
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, StateStoreError> {
        self.expire(job_id, Instant::now());
        Ok(self.cancelled.contains_key(&job_id))
    }

    async fn clear_cancel(&self, job_id: Uuid) -> Result<(), StateStoreError> {
        self.cancelled.remove(&job_id);
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), StateStoreError> {
        self.snapshots.remove(&job_id);
        self.cancelled.remove(&job_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StateStoreError> {
        let now = Instant::now();
        let mut removed = 0;
        self.snapshots.retain(|_, stored| {
            let keep = stored.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.cancelled.retain(|_, expires_at| *expires_at > now);
        Ok(removed)
    }
}
