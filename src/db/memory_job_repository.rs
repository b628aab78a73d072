use crate::db::{ActiveJob, JobProgress, JobRepository};
use crate::errors::StorageError;
use crate::models::{AnalysisResultRow, JobRecord, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Process-local [`JobRepository`] with the same duplicate-aware insert
/// semantics as the Postgres implementation.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    results: Mutex<Vec<AnalysisResultRow>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn all_results(&self) -> Vec<AnalysisResultRow> {
        self.results.lock().clone()
    }
}

fn is_active(status: &str) -> bool {
    status
        .parse::<JobState>()
        .map(JobState::is_active)
        .unwrap_or(false)
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert_job(&self, job: &JobRecord, active_since: DateTime<Utc>) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock();

        if jobs.contains_key(&job.id) {
            return Err(StorageError::AlreadyExists(format!("job {}", job.id)));
        }

        let duplicate = jobs.values().any(|existing| {
            existing.ticker_fingerprint == job.ticker_fingerprint
                && is_active(&existing.status)
                && existing.created_at >= active_since
        });
        if duplicate {
            return Err(StorageError::AlreadyExists(format!(
                "active job for {}",
                job.ticker_fingerprint
            )));
        }

        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StorageError::Permanent(format!("job {} does not exist", job.id))),
        }
    }

    async fn update_job_progress(&self, job_id: Uuid, progress: JobProgress) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&job_id) {
            Some(existing) => {
                existing.completed = progress.completed;
                existing.successful = progress.successful;
                Ok(())
            }
            None => Err(StorageError::Permanent(format!("job {} does not exist", job_id))),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StorageError> {
        Ok(self.jobs.lock().get(&job_id).cloned())
    }

    async fn find_active_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<ActiveJob>, StorageError> {
        let mut active: Vec<ActiveJob> = self
            .jobs
            .lock()
            .values()
            .filter(|job| is_active(&job.status) && job.created_at >= since)
            .map(|job| ActiveJob {
                id: job.id,
                status: job.status.clone(),
                ticker_fingerprint: job.ticker_fingerprint.clone(),
                created_at: job.created_at,
            })
            .collect();

        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn save_result(&self, row: &AnalysisResultRow) -> Result<(), StorageError> {
        let mut results = self.results.lock();
        if !results.iter().any(|existing| existing.id == row.id) {
            results.push(row.clone());
        }
        Ok(())
    }

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<AnalysisResultRow>, StorageError> {
        Ok(self
            .results
            .lock()
            .iter()
            .filter(|row| row.job_id == Some(job_id))
            .cloned()
            .collect())
    }
}
