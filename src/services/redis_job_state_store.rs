use crate::errors::StateStoreError;
use crate::models::JobSnapshot;
use crate::services::job_state_store::JobStateStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const KEY_PREFIX: &str = "analysis_job";

/// Redis-backed [`JobStateStore`] so several workers can share progress and
/// cancellation. Every key carries the configured TTL.
#[derive(Clone)]
pub struct RedisJobStateStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisJobStateStore {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, StateStoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        info!("✅ Connected to Redis job state store (ttl {}s)", ttl.as_secs());

        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    fn snapshot_key(job_id: Uuid) -> String {
        format!("{}:{}", KEY_PREFIX, job_id)
    }

    fn cancel_key(job_id: Uuid) -> String {
        format!("{}:{}:cancel", KEY_PREFIX, job_id)
    }
}

#[async_trait]
impl JobStateStore for RedisJobStateStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, StateStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::snapshot_key(job_id)).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut snapshot: JobSnapshot = serde_json::from_str(&raw)?;
        snapshot.cancel_requested = conn.exists(Self::cancel_key(job_id)).await?;
        Ok(Some(snapshot))
    }

    async fn set(&self, snapshot: &JobSnapshot) -> Result<(), StateStoreError> {
        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::snapshot_key(snapshot.job_id), payload, self.ttl_secs)
            .await?;
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, StateStoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::snapshot_key(job_id)).await?;
        if !exists {
            return Ok(false);
        }

        conn.set_ex::<_, _, ()>(Self::cancel_key(job_id), 1, self.ttl_secs)
            .await?;
        Ok(true)
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, StateStoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(Self::cancel_key(job_id)).await?)
    }

    async fn clear_cancel(&self, job_id: Uuid) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::cancel_key(job_id)).await?;
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![Self::snapshot_key(job_id), Self::cancel_key(job_id)])
            .await?;
        Ok(())
    }
}
