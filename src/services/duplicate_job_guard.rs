use crate::db::JobRepository;
use crate::errors::{AppError, StorageError};
use crate::models::ticker::{parse_fingerprint, parse_tickers};
use crate::models::{AnalysisJob, JobEvent, JobState};
use crate::services::retry::RetryPolicy;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_LOOKUP_ATTEMPTS: u32 = 3;

/// Outcome of a create request
#[derive(Debug)]
pub enum JobAdmission {
    /// New job, persisted as QUEUED and ready to submit
    Created(AnalysisJob),
    /// An in-flight job already covers the same ticker set
    Duplicate { job_id: Uuid, status: JobState },
}

impl JobAdmission {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobAdmission::Created(job) => job.id,
            JobAdmission::Duplicate { job_id, .. } => *job_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, JobAdmission::Duplicate { .. })
    }
}

/// Admits new analysis jobs, collapsing requests whose normalized ticker set
/// matches a QUEUED/RUNNING job created inside the window.
pub struct DuplicateJobGuard {
    repo: Arc<dyn JobRepository>,
    window: Duration,
    lookup_attempts: u32,
    backoff: RetryPolicy,
}

impl DuplicateJobGuard {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            repo,
            window: DEFAULT_DUPLICATE_WINDOW,
            lookup_attempts: DEFAULT_LOOKUP_ATTEMPTS,
            backoff: RetryPolicy::new(DEFAULT_LOOKUP_ATTEMPTS, Duration::from_millis(100)),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_lookup_attempts(mut self, attempts: u32, backoff: RetryPolicy) -> Self {
        self.lookup_attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    fn active_since(&self) -> chrono::DateTime<Utc> {
        let window = chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Utc::now() - window
    }

    /// Find an active job whose stored fingerprint holds the same tickers.
    pub async fn find_duplicate(&self, tickers: &[String]) -> Result<Option<(Uuid, JobState)>, StorageError> {
        let active = self.repo.find_active_jobs_since(self.active_since()).await?;

        for candidate in active {
            let Some(stored) = parse_fingerprint(&candidate.ticker_fingerprint) else {
                warn!(
                    "Job {} has an unreadable ticker fingerprint: {}",
                    candidate.id, candidate.ticker_fingerprint
                );
                continue;
            };

            if stored == tickers {
                let status = candidate
                    .status
                    .parse::<JobState>()
                    .map_err(StorageError::Permanent)?;
                return Ok(Some((candidate.id, status)));
            }
        }

        Ok(None)
    }

    /// Validate the request, then either return the in-flight duplicate or
    /// atomically persist a new QUEUED job.
    pub async fn admit(
        &self,
        tickers: &[String],
        capital: f64,
        indicators: Option<Vec<String>>,
        demo: bool,
    ) -> Result<JobAdmission, AppError> {
        let parsed = parse_tickers(tickers).map_err(AppError::Validation)?;
        let mut job = AnalysisJob::new(parsed, capital, indicators, demo)?;
        job.transition(JobEvent::Queue, json!({ "source": "create_job" }))?;

        let fingerprint = job.fingerprint();
        let normalized = parse_fingerprint(&fingerprint)
            .ok_or_else(|| AppError::Invariant(format!("unreadable fingerprint {}", fingerprint)))?;
        let record = job.to_record();

        let mut attempt = 1;
        loop {
            match self.find_duplicate(&normalized).await {
                Ok(Some((job_id, status))) => {
                    info!("🔁 Reusing in-flight job {} ({}) for {}", job_id, status, fingerprint);
                    return Ok(JobAdmission::Duplicate { job_id, status });
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() && attempt < self.lookup_attempts => {
                    warn!("Duplicate lookup for {} failed (attempt {}): {}", fingerprint, attempt, e);
                    tokio::time::sleep(self.backoff.jittered_delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(AppError::CreationFailed(format!("duplicate lookup failed: {}", e))),
            }

            match self.repo.insert_job(&record, self.active_since()).await {
                Ok(()) => {
                    info!("🆕 Created analysis job {} for {} ticker(s)", job.id, job.total());
                    return Ok(JobAdmission::Created(job));
                }
                Err(e) if attempt >= self.lookup_attempts => {
                    return Err(AppError::CreationFailed(format!(
                        "could not create job for {} after {} attempts: {}",
                        fingerprint, attempt, e
                    )));
                }
                Err(StorageError::AlreadyExists(reason)) => {
                    debug!("Lost creation race for {} ({}), looking up winner", fingerprint, reason);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Insert of job {} failed (attempt {}): {}", job.id, attempt, e);
                }
                Err(e) => return Err(AppError::CreationFailed(e.to_string())),
            }

            tokio::time::sleep(self.backoff.jittered_delay(attempt)).await;
            attempt += 1;
        }
    }
}
