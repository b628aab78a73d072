//! Job and result persistence.
//!
//! The engine only talks to [`JobRepository`]; the Postgres implementation
//! lives in `analysis_job_queries` and an in-memory one backs tests and
//! database-less runs.

pub mod analysis_job_queries;
pub mod memory_job_repository;

use crate::errors::StorageError;
use crate::models::{AnalysisResultRow, JobRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub use analysis_job_queries::PgJobRepository;
pub use memory_job_repository::InMemoryJobRepository;

/// Minimal view of an in-flight job used by duplicate detection
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ActiveJob {
    pub id: Uuid,
    pub status: String,
    pub ticker_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Counters written after every processed ticker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub completed: i32,
    pub successful: i32,
    pub progress_percent: f64,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Atomically insert a job. Fails with `AlreadyExists` when the id is
    /// taken or a QUEUED/RUNNING job with the same ticker fingerprint was
    /// created at or after `active_since`.
    async fn insert_job(&self, job: &JobRecord, active_since: DateTime<Utc>) -> Result<(), StorageError>;

    async fn update_job(&self, job: &JobRecord) -> Result<(), StorageError>;

    async fn update_job_progress(&self, job_id: Uuid, progress: JobProgress) -> Result<(), StorageError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StorageError>;

    /// QUEUED/RUNNING jobs created at or after `since`, newest first
    async fn find_active_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<ActiveJob>, StorageError>;

    async fn save_result(&self, row: &AnalysisResultRow) -> Result<(), StorageError>;

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<AnalysisResultRow>, StorageError>;
}
