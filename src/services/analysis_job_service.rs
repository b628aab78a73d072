use crate::db::JobRepository;
use crate::errors::AppError;
use crate::models::{AnalysisJob, AnalysisResultRow, JobErrorEntry, JobEvent, JobSnapshot, JobState};
use crate::services::bulk_fanout::{BulkFanoutCoordinator, DEFAULT_BULK_WORKERS};
use crate::services::duplicate_job_guard::{
    DuplicateJobGuard, JobAdmission, DEFAULT_DUPLICATE_WINDOW, DEFAULT_LOOKUP_ATTEMPTS,
};
use crate::services::job_orchestrator::{JobOrchestrator, DEFAULT_JOB_TIMEOUT};
use crate::services::job_registry::JobRegistry;
use crate::services::job_state_store::JobStateStore;
use crate::services::retry::{retry_storage, RetryPolicy};
use crate::services::ticker_analyzer::TickerAnalyzer;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobState,
    pub is_duplicate: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobState,
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub errors: Vec<JobErrorEntry>,
    pub progress_percent: f64,
    pub storage_warnings: usize,
}

impl From<JobSnapshot> for JobStatusResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            job_id: snapshot.job_id,
            status: snapshot.status,
            total: snapshot.total,
            completed: snapshot.completed,
            successful: snapshot.successful,
            errors: snapshot.errors,
            progress_percent: snapshot.progress_percent,
            storage_warnings: snapshot.storage_warnings.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetryJobResponse {
    pub job_id: Uuid,
    pub status: JobState,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BulkRunResponse {
    pub requested: usize,
    pub completed: usize,
    pub successful: usize,
}

/// Tunables for the engine; see `EngineConfig` for the environment mapping.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub duplicate_window: Duration,
    pub duplicate_lookup_attempts: u32,
    pub duplicate_backoff: RetryPolicy,
    pub storage_retry: RetryPolicy,
    pub job_timeout: Duration,
    pub bulk_workers: usize,
    pub bulk_capital: f64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            duplicate_lookup_attempts: DEFAULT_LOOKUP_ATTEMPTS,
            duplicate_backoff: RetryPolicy::new(DEFAULT_LOOKUP_ATTEMPTS, Duration::from_millis(100)),
            storage_retry: RetryPolicy::default(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            bulk_workers: DEFAULT_BULK_WORKERS,
            bulk_capital: 100_000.0,
        }
    }
}

/// Entry point for callers: create, poll, cancel and retry analysis jobs,
/// and run bulk analyses.
pub struct AnalysisJobService {
    repo: Arc<dyn JobRepository>,
    state_store: Arc<dyn JobStateStore>,
    guard: DuplicateJobGuard,
    orchestrator: JobOrchestrator,
    bulk: BulkFanoutCoordinator,
    storage_retry: RetryPolicy,
}

impl AnalysisJobService {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        state_store: Arc<dyn JobStateStore>,
        analyzer: Arc<dyn TickerAnalyzer>,
        registry: JobRegistry,
        options: ServiceOptions,
    ) -> Self {
        let guard = DuplicateJobGuard::new(repo.clone())
            .with_window(options.duplicate_window)
            .with_lookup_attempts(options.duplicate_lookup_attempts, options.duplicate_backoff);

        let orchestrator = JobOrchestrator::new(repo.clone(), state_store.clone(), analyzer.clone(), registry)
            .with_retry_policy(options.storage_retry)
            .with_job_timeout(options.job_timeout);

        let bulk = BulkFanoutCoordinator::new(repo.clone(), analyzer, options.bulk_capital)
            .with_retry_policy(options.storage_retry)
            .with_default_workers(options.bulk_workers);

        Self {
            repo,
            state_store,
            guard,
            orchestrator,
            bulk,
            storage_retry: options.storage_retry,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        self.orchestrator.registry()
    }

    /// Create and start a job, or return the in-flight job that already
    /// covers the same ticker set.
    pub async fn create_job(
        &self,
        tickers: &[String],
        capital: f64,
        indicators: Option<Vec<String>>,
        demo: bool,
    ) -> Result<CreateJobResponse, AppError> {
        let job = match self.guard.admit(tickers, capital, indicators, demo).await? {
            JobAdmission::Duplicate { job_id, status } => {
                return Ok(CreateJobResponse {
                    job_id,
                    status,
                    is_duplicate: true,
                });
            }
            JobAdmission::Created(job) => job,
        };

        let job_id = job.id;
        if let Err(e) = self.state_store.set(&job.snapshot()).await {
            warn!("Job {}: initial snapshot not stored: {}", job_id, e);
        }

        let started = self.orchestrator.submit(job).await?;
        Ok(CreateJobResponse {
            job_id,
            status: self.status_after_submit(job_id, started).await,
            is_duplicate: false,
        })
    }

    /// A submit that did not start a worker may have found the job already
    /// cancelled, so report what is stored.
    async fn status_after_submit(&self, job_id: Uuid, started: bool) -> JobState {
        if started {
            return JobState::Running;
        }
        self.load_snapshot(job_id)
            .await
            .map(|snapshot| snapshot.status)
            .unwrap_or(JobState::Queued)
    }

    /// Progress from the state store, falling back to the repository.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusResponse, AppError> {
        Ok(self.load_snapshot(job_id).await?.into())
    }

    async fn load_snapshot(&self, job_id: Uuid) -> Result<JobSnapshot, AppError> {
        match self.state_store.get(job_id).await {
            Ok(Some(snapshot)) if !snapshot.status.is_active() || self.registry().is_running(job_id) => {
                return Ok(snapshot)
            }
            Ok(Some(snapshot)) => return Ok(self.reconcile_snapshot(snapshot).await),
            Ok(None) => {}
            Err(e) => warn!("Job {}: state store read failed, using repository: {}", job_id, e),
        }

        match self.repo.get_job(job_id).await? {
            Some(record) => Ok(AnalysisJob::from_record(record)?.snapshot()),
            None => Err(AppError::NotFound(job_id)),
        }
    }

    /// The store says active but no worker holds the job. A finished row in
    /// the repository wins over the stale snapshot, which is then repaired.
    async fn reconcile_snapshot(&self, snapshot: JobSnapshot) -> JobSnapshot {
        let job_id = snapshot.job_id;
        let stored = match self.repo.get_job(job_id).await {
            Ok(Some(record)) => AnalysisJob::from_record(record),
            Ok(None) => return snapshot,
            Err(e) => {
                warn!("Job {}: repository read failed, keeping snapshot: {}", job_id, e);
                return snapshot;
            }
        };

        match stored {
            Ok(job) if !job.status().is_active() => {
                let repaired = job.snapshot();
                if let Err(e) = self.state_store.set(&repaired).await {
                    warn!("Job {}: stale snapshot not repaired: {}", job_id, e);
                }
                info!("Job {}: snapshot said {}, repository says {}", job_id, snapshot.status, repaired.status);
                repaired
            }
            Ok(_) => snapshot,
            Err(e) => {
                warn!("Job {}: stored row unreadable, keeping snapshot: {}", job_id, e);
                snapshot
            }
        }
    }

    /// Request cancellation. Accepted only while the job is QUEUED or
    /// RUNNING; the worker stops before its next ticker.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelJobResponse, AppError> {
        let snapshot = self.load_snapshot(job_id).await?;
        if !snapshot.status.is_active() {
            info!("Cancel for job {} ignored, status is {}", job_id, snapshot.status);
            return Ok(CancelJobResponse {
                job_id,
                accepted: false,
            });
        }

        // Raised before the registry check: a worker spawned after this
        // point sees the flag before its first ticker.
        if !self.state_store.cancel(job_id).await? {
            self.state_store.set(&snapshot).await?;
            self.state_store.cancel(job_id).await?;
        }

        let accepted = if self.registry().is_running(job_id) {
            true
        } else {
            self.cancel_orphaned(job_id).await?
        };

        if accepted {
            info!("🛑 Cancellation requested for job {}", job_id);
        }
        Ok(CancelJobResponse { job_id, accepted })
    }

    /// Cancel a job that no worker holds, straight through the repository.
    /// Returns false when the stored job already finished some other way.
    async fn cancel_orphaned(&self, job_id: Uuid) -> Result<bool, AppError> {
        let record = self.repo.get_job(job_id).await?.ok_or(AppError::NotFound(job_id))?;
        let mut job = AnalysisJob::from_record(record)?;

        match job.status() {
            JobState::Cancelled => return Ok(true),
            status if !status.is_active() => {
                info!("Cancel for job {} ignored, stored status is {}", job_id, status);
                self.state_store.clear_cancel(job_id).await?;
                self.state_store.set(&job.snapshot()).await?;
                return Ok(false);
            }
            _ => {}
        }

        job.transition(JobEvent::Cancel, json!({ "requested_by": "user", "worker": "none" }))?;

        let record = job.to_record();
        retry_storage(&self.storage_retry, "cancel_job", || self.repo.update_job(&record)).await?;
        self.state_store.set(&job.snapshot()).await?;

        info!("🛑 Job {} cancelled without a running worker", job_id);
        Ok(true)
    }

    /// Re-queue a FAILED job with fresh counters and start it again.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<RetryJobResponse, AppError> {
        let record = self.repo.get_job(job_id).await?.ok_or(AppError::NotFound(job_id))?;
        let mut job = AnalysisJob::from_record(record)?;
        job.transition(JobEvent::Retry, json!({ "requested_by": "user" }))?;

        let record = job.to_record();
        retry_storage(&self.storage_retry, "retry_job", || self.repo.update_job(&record)).await?;
        self.state_store.clear_cancel(job_id).await?;
        self.state_store.set(&job.snapshot()).await?;

        info!("🔄 Retrying job {} ({} tickers)", job_id, job.total());
        let started = self.orchestrator.submit(job).await?;
        Ok(RetryJobResponse {
            job_id,
            status: self.status_after_submit(job_id, started).await,
        })
    }

    pub async fn run_bulk(
        &self,
        tickers: &[String],
        demo: bool,
        max_workers: Option<usize>,
    ) -> BulkRunResponse {
        let summary = self.bulk.run(tickers, demo, max_workers).await;
        BulkRunResponse {
            requested: summary.requested,
            completed: summary.completed,
            successful: summary.successful,
        }
    }

    pub async fn job_results(&self, job_id: Uuid) -> Result<Vec<AnalysisResultRow>, AppError> {
        Ok(self.repo.list_results(job_id).await?)
    }

    /// Wait for every running job worker to finish.
    pub async fn shutdown(&self) {
        self.registry().wait_all().await;
        info!("✅ All analysis jobs drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryJobRepository;
    use crate::services::indicator_cache::IndicatorResultCache;
    use crate::services::job_state_store::InMemoryJobStateStore;
    use crate::services::ticker_analyzer::DemoAnalyzer;

    fn service() -> (AnalysisJobService, Arc<InMemoryJobRepository>) {
        let repo = Arc::new(InMemoryJobRepository::new());
        let options = ServiceOptions {
            storage_retry: RetryPolicy::immediate(3),
            duplicate_backoff: RetryPolicy::immediate(3),
            ..ServiceOptions::default()
        };
        let service = AnalysisJobService::new(
            repo.clone(),
            Arc::new(InMemoryJobStateStore::new()),
            Arc::new(DemoAnalyzer::new(Arc::new(IndicatorResultCache::default()))),
            JobRegistry::new(),
            options,
        );
        (service, repo)
    }

    fn strings(symbols: &[&str]) -> Vec<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_and_poll_demo_job() {
        let (service, _) = service();

        let created = service
            .create_job(&strings(&["AAPL", "MSFT"]), 50_000.0, None, true)
            .await
            .unwrap();
        assert!(!created.is_duplicate);
        assert_eq!(created.status, JobState::Running);

        service.shutdown().await;

        let status = service.get_status(created.job_id).await.unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.completed, 2);
        assert_eq!(status.successful, 2);
        assert_eq!(status.progress_percent, 100.0);
        assert_eq!(service.job_results(created.job_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (service, _) = service();
        let id = Uuid::new_v4();

        assert!(matches!(service.get_status(id).await, Err(AppError::NotFound(found)) if found == id));
        assert!(matches!(service.cancel_job(id).await, Err(AppError::NotFound(_))));
        assert!(matches!(service.retry_job(id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_rejected() {
        let (service, _) = service();
        let created = service
            .create_job(&strings(&["AAPL"]), 50_000.0, None, true)
            .await
            .unwrap();
        service.shutdown().await;

        let response = service.cancel_job(created.job_id).await.unwrap();
        assert!(!response.accepted);
    }

    #[tokio::test]
    async fn test_stale_running_snapshot_defers_to_finished_row() {
        let (service, _) = service();
        let created = service
            .create_job(&strings(&["AAPL"]), 50_000.0, None, true)
            .await
            .unwrap();
        service.shutdown().await;

        let mut stale = service.state_store.get(created.job_id).await.unwrap().unwrap();
        stale.status = JobState::Running;
        service.state_store.set(&stale).await.unwrap();
        assert_eq!(service.get_status(created.job_id).await.unwrap().status, JobState::Completed);

        // Worker finished between the status read and the registry check
        service.state_store.set(&stale).await.unwrap();
        service.state_store.cancel(created.job_id).await.unwrap();
        assert!(!service.cancel_orphaned(created.job_id).await.unwrap());
        assert!(!service.state_store.is_cancelled(created.job_id).await.unwrap());
        let repaired = service.state_store.get(created.job_id).await.unwrap().unwrap();
        assert_eq!(repaired.status, JobState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_without_worker() {
        let (service, repo) = service();
        let mut job = AnalysisJob::new(
            crate::models::ticker::parse_tickers(&["AAPL"]).unwrap(),
            1_000.0,
            None,
            true,
        )
        .unwrap();
        job.transition(JobEvent::Queue, json!({})).unwrap();
        repo.insert_job(&job.to_record(), chrono::Utc::now()).await.unwrap();

        let response = service.cancel_job(job.id).await.unwrap();
        assert!(response.accepted);
        assert_eq!(service.get_status(job.id).await.unwrap().status, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_job() {
        let (service, _) = service();
        let created = service
            .create_job(&strings(&["AAPL"]), 50_000.0, None, true)
            .await
            .unwrap();
        service.shutdown().await;

        assert!(matches!(
            service.retry_job(created.job_id).await,
            Err(AppError::Transition(_))
        ));
    }

    #[tokio::test]
    async fn test_run_bulk_counts_resolved_and_successful() {
        let (service, repo) = service();
        let response = service
            .run_bulk(&strings(&["AAPL", "MSFT", ""]), true, Some(2))
            .await;

        assert_eq!(
            response,
            BulkRunResponse {
                requested: 3,
                completed: 3,
                successful: 2
            }
        );
        assert_eq!(repo.all_results().len(), 3);
    }
}
