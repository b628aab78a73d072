use crate::db::{JobProgress, JobRepository};
use crate::errors::AppError;
use crate::models::{AnalysisJob, AnalysisResultRow, JobEvent, JobState, Ticker};
use crate::services::job_registry::JobRegistry;
use crate::services::job_state_machine::panic_message;
use crate::services::job_state_store::JobStateStore;
use crate::services::retry::{retry_storage, RetryPolicy};
use crate::services::ticker_analyzer::TickerAnalyzer;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How the ticker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopOutcome {
    Finished,
    Cancelled,
    TimedOut,
}

/// Runs one supervised worker per job. The worker is the only writer of its
/// job's counters; everyone else reads snapshots from the state store or the
/// repository.
#[derive(Clone)]
pub struct JobOrchestrator {
    repo: Arc<dyn JobRepository>,
    state_store: Arc<dyn JobStateStore>,
    analyzer: Arc<dyn TickerAnalyzer>,
    registry: JobRegistry,
    retry: RetryPolicy,
    job_timeout: Duration,
}

impl JobOrchestrator {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        state_store: Arc<dyn JobStateStore>,
        analyzer: Arc<dyn TickerAnalyzer>,
        registry: JobRegistry,
    ) -> Self {
        Self {
            repo,
            state_store,
            analyzer,
            registry,
            retry: RetryPolicy::default(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Move a QUEUED job to RUNNING and hand it to a new worker task.
    /// Returns `Ok(false)` when a worker for this job id is already live, or
    /// when a cancel arrived first and the job was cancelled instead.
    pub async fn submit(&self, mut job: AnalysisJob) -> Result<bool, AppError> {
        if self.registry.is_running(job.id) {
            debug!("Job {} is already being processed", job.id);
            return Ok(false);
        }

        if self.cancel_requested(&mut job, None).await {
            job.transition(JobEvent::Cancel, json!({ "requested_by": "user", "worker": "none" }))?;
            self.persist_job(&mut job, "cancel_job").await;
            self.clear_cancel_flag(job.id).await;
            info!("🛑 Job {} was cancelled before its worker started", job.id);
            return Ok(false);
        }

        job.transition(JobEvent::Start, json!({ "tickers": job.total() }))?;
        self.persist_job(&mut job, "start_job").await;

        let job_id = job.id;
        let worker = self.clone();
        let started = self.registry.spawn(job_id, async move {
            worker.run_worker(job).await;
        });

        if started {
            info!("🚀 Started worker for job {}", job_id);
        }
        Ok(started)
    }

    async fn run_worker(self, mut job: AnalysisJob) {
        let job_id = job.id;
        let outcome = AssertUnwindSafe(self.process_tickers(&mut job))
            .catch_unwind()
            .await;

        let (event, metadata) = match outcome {
            Ok(Ok(LoopOutcome::Finished)) => (JobEvent::Complete, json!({})),
            Ok(Ok(LoopOutcome::Cancelled)) => (JobEvent::Cancel, json!({ "requested_by": "user" })),
            Ok(Ok(LoopOutcome::TimedOut)) => (
                JobEvent::Timeout,
                json!({ "timeout_secs": self.job_timeout.as_secs() }),
            ),
            Ok(Err(e)) => {
                error!("❌ Job {} failed: {}", job_id, e);
                job.record_job_error(e.to_string());
                (JobEvent::Fail, json!({ "error": e.to_string() }))
            }
            Err(payload) => {
                let message = format!("worker panicked: {}", panic_message(payload.as_ref()));
                error!("❌ Job {} failed: {}", job_id, message);
                job.record_job_error(message.clone());
                (JobEvent::Fail, json!({ "error": message }))
            }
        };

        if let Err(e) = job.transition(event, metadata) {
            error!("Job {} could not apply '{}': {}", job_id, event, e);
        }

        self.persist_job(&mut job, "finish_job").await;
        self.clear_cancel_flag(job_id).await;

        match job.status() {
            JobState::Completed => info!(
                "✅ Job {} completed: {}/{} tickers successful, {} error(s)",
                job_id,
                job.successful(),
                job.total(),
                job.errors().len()
            ),
            JobState::Cancelled => info!(
                "🛑 Job {} cancelled after {}/{} tickers",
                job_id,
                job.completed(),
                job.total()
            ),
            JobState::Timeout => warn!(
                "⏱️ Job {} timed out after {}/{} tickers",
                job_id,
                job.completed(),
                job.total()
            ),
            other => warn!("Job {} ended in state {}", job_id, other),
        }
    }

    async fn process_tickers(&self, job: &mut AnalysisJob) -> Result<LoopOutcome, AppError> {
        let started = Instant::now();
        let tickers: Vec<Ticker> = job.tickers().to_vec();

        for (index, ticker) in tickers.iter().enumerate() {
            if self.cancel_requested(job, Some(ticker)).await {
                info!("Job {} saw cancellation before {} ({}/{})", job.id, ticker, index, job.total());
                return Ok(LoopOutcome::Cancelled);
            }

            if started.elapsed() >= self.job_timeout {
                return Ok(LoopOutcome::TimedOut);
            }

            let analysis = self
                .analyzer
                .analyze(ticker, job.indicators(), job.capital(), job.demo())
                .await;

            let outcome = match analysis {
                Ok(result) => {
                    let row = AnalysisResultRow::completed(Some(job.id), result);
                    let saved = retry_storage(&self.retry, "save_result", || self.repo.save_result(&row)).await;
                    if let Err(e) = saved {
                        error!("Job {}: result for {} was not persisted: {}", job.id, ticker, e);
                        job.record_storage_warning(Some(ticker), "save_result", e.to_string());
                    }
                    Ok(())
                }
                Err(e) => {
                    warn!("Job {}: analysis of {} failed: {}", job.id, ticker, e);
                    Err(e.to_string())
                }
            };

            job.record_outcome(ticker, outcome)?;
            self.publish_progress(job, ticker).await;
        }

        Ok(LoopOutcome::Finished)
    }

    /// Read errors count as "not cancelled" and are kept as a warning.
    async fn cancel_requested(&self, job: &mut AnalysisJob, ticker: Option<&Ticker>) -> bool {
        match self.state_store.is_cancelled(job.id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!("Job {}: cancel flag read failed, continuing: {}", job.id, e);
                job.record_storage_warning(ticker, "read_cancel_flag", e.to_string());
                false
            }
        }
    }

    async fn clear_cancel_flag(&self, job_id: Uuid) {
        if let Err(e) = self.state_store.clear_cancel(job_id).await {
            debug!("Job {}: cancel flag not cleared: {}", job_id, e);
        }
    }

    /// Best-effort progress write to both stores.
    async fn publish_progress(&self, job: &mut AnalysisJob, ticker: &Ticker) {
        if let Err(e) = self.state_store.set(&job.snapshot()).await {
            warn!("Job {}: progress snapshot not stored: {}", job.id, e);
            job.record_storage_warning(Some(ticker), "write_snapshot", e.to_string());
        }

        let progress = JobProgress {
            completed: job.completed() as i32,
            successful: job.successful() as i32,
            progress_percent: job.progress_percent(),
        };
        if let Err(e) = self.repo.update_job_progress(job.id, progress).await {
            warn!("Job {}: progress row not updated: {}", job.id, e);
            job.record_storage_warning(Some(ticker), "update_progress", e.to_string());
        }
    }

    /// Write the whole job row (with retry) and its snapshot. Failures are
    /// absorbed as storage warnings.
    async fn persist_job(&self, job: &mut AnalysisJob, operation: &str) {
        let record = job.to_record();
        if let Err(e) = retry_storage(&self.retry, operation, || self.repo.update_job(&record)).await {
            error!("Job {}: {} not persisted: {}", job.id, operation, e);
            job.record_storage_warning(None, operation, e.to_string());
        }

        if let Err(e) = self.state_store.set(&job.snapshot()).await {
            warn!("Job {}: snapshot not stored during {}: {}", job.id, operation, e);
            job.record_storage_warning(None, operation, e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ActiveJob, InMemoryJobRepository};
    use crate::errors::{AnalysisError, StorageError};
    use crate::models::ticker::parse_tickers;
    use crate::models::{AnalysisResult, JobRecord, Signal};
    use crate::services::job_state_store::InMemoryJobStateStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Succeeds for every ticker except those listed
    struct ScriptedAnalyzer {
        failing: Vec<&'static str>,
        panicking: Vec<&'static str>,
        delay: Duration,
    }

    impl ScriptedAnalyzer {
        fn failing(failing: Vec<&'static str>) -> Self {
            Self {
                failing,
                panicking: Vec::new(),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TickerAnalyzer for ScriptedAnalyzer {
        async fn analyze(
            &self,
            ticker: &Ticker,
            _indicators: Option<&[String]>,
            _capital: f64,
            demo: bool,
        ) -> Result<AnalysisResult, AnalysisError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panicking.iter().any(|s| *s == ticker.as_str()) {
                panic!("analyzer blew up on {}", ticker);
            }
            if self.failing.iter().any(|s| *s == ticker.as_str()) {
                return Err(AnalysisError::DataUnavailable(format!("no data for {}", ticker)));
            }
            Ok(AnalysisResult {
                ticker: ticker.to_string(),
                signal: Signal::Hold,
                score: 0.0,
                confidence: 0.0,
                votes: Vec::new(),
                position_size: 0.0,
                demo,
                analyzed_at: Utc::now(),
            })
        }
    }

    /// Delegates to the in-memory repository but fails every result write.
    struct BrokenResultsRepo {
        inner: InMemoryJobRepository,
        save_attempts: AtomicU32,
    }

    #[async_trait]
    impl JobRepository for BrokenResultsRepo {
        async fn insert_job(&self, job: &JobRecord, since: DateTime<Utc>) -> Result<(), StorageError> {
            self.inner.insert_job(job, since).await
        }
        async fn update_job(&self, job: &JobRecord) -> Result<(), StorageError> {
            self.inner.update_job(job).await
        }
        async fn update_job_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), StorageError> {
            self.inner.update_job_progress(id, progress).await
        }
        async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, StorageError> {
            self.inner.get_job(id).await
        }
        async fn find_active_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<ActiveJob>, StorageError> {
            self.inner.find_active_jobs_since(since).await
        }
        async fn save_result(&self, _row: &AnalysisResultRow) -> Result<(), StorageError> {
            self.save_attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Transient("connection reset".into()))
        }
        async fn list_results(&self, id: Uuid) -> Result<Vec<AnalysisResultRow>, StorageError> {
            self.inner.list_results(id).await
        }
    }

    struct Harness {
        repo: Arc<dyn JobRepository>,
        store: Arc<InMemoryJobStateStore>,
        orchestrator: JobOrchestrator,
    }

    fn harness(repo: Arc<dyn JobRepository>, analyzer: ScriptedAnalyzer) -> Harness {
        let store = Arc::new(InMemoryJobStateStore::new());
        let orchestrator = JobOrchestrator::new(repo.clone(), store.clone(), Arc::new(analyzer), JobRegistry::new())
            .with_retry_policy(RetryPolicy::immediate(3));
        Harness {
            repo,
            store,
            orchestrator,
        }
    }

    async fn queued_job(repo: &Arc<dyn JobRepository>, symbols: &[&str]) -> AnalysisJob {
        let mut job = AnalysisJob::new(parse_tickers(symbols).unwrap(), 10_000.0, None, true).unwrap();
        job.transition(JobEvent::Queue, json!({})).unwrap();
        repo.insert_job(&job.to_record(), Utc::now()).await.unwrap();
        job
    }

    async fn stored_job(repo: &Arc<dyn JobRepository>, id: Uuid) -> AnalysisJob {
        AnalysisJob::from_record(repo.get_job(id).await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_failing_ticker_does_not_abort_job() {
        let h = harness(Arc::new(InMemoryJobRepository::new()), ScriptedAnalyzer::failing(vec!["BAD"]));
        let job = queued_job(&h.repo, &["AAPL", "BAD"]).await;
        let id = job.id;

        assert!(h.orchestrator.submit(job).await.unwrap());
        h.orchestrator.registry().wait_all().await;

        let stored = stored_job(&h.repo, id).await;
        assert_eq!(stored.status(), JobState::Completed);
        assert_eq!(stored.completed(), 2);
        assert_eq!(stored.successful(), 1);
        assert_eq!(stored.errors().len(), 1);
        assert_eq!(stored.errors()[0].ticker, "BAD");
        assert!(stored.completed_at().is_some());

        let results = h.repo.list_results(id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ticker, "AAPL");

        let snapshot = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobState::Completed);
        assert_eq!(snapshot.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn test_cancel_before_submit_never_starts_worker() {
        let h = harness(Arc::new(InMemoryJobRepository::new()), ScriptedAnalyzer::failing(Vec::new()));
        let job = queued_job(&h.repo, &["AAPL", "MSFT", "TSLA"]).await;
        let id = job.id;
        h.store.set(&job.snapshot()).await.unwrap();
        h.store.cancel(id).await.unwrap();

        assert!(!h.orchestrator.submit(job).await.unwrap());
        assert_eq!(h.orchestrator.registry().active_count(), 0);

        let stored = stored_job(&h.repo, id).await;
        assert_eq!(stored.status(), JobState::Cancelled);
        assert_eq!(stored.completed(), 0);
        assert!(stored.started_at().is_none());
        assert!(h.repo.list_results(id).await.unwrap().is_empty());
        assert!(!h.store.is_cancelled(id).await.unwrap());
        assert_eq!(h.store.get(id).await.unwrap().unwrap().status, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_running_worker_and_is_cleared() {
        let analyzer = ScriptedAnalyzer {
            failing: Vec::new(),
            panicking: Vec::new(),
            delay: Duration::from_millis(30),
        };
        let h = harness(Arc::new(InMemoryJobRepository::new()), analyzer);
        let job = queued_job(&h.repo, &["AAPL", "MSFT", "TSLA", "NVDA", "AMZN"]).await;
        let id = job.id;

        assert!(h.orchestrator.submit(job).await.unwrap());
        h.store.cancel(id).await.unwrap();
        h.orchestrator.registry().wait_all().await;

        let stored = stored_job(&h.repo, id).await;
        assert_eq!(stored.status(), JobState::Cancelled);
        assert!(stored.completed() < 5);
        assert!(!h.store.is_cancelled(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_panic_marks_job_failed_and_releases_worker() {
        let analyzer = ScriptedAnalyzer {
            failing: Vec::new(),
            panicking: vec!["MSFT"],
            delay: Duration::ZERO,
        };
        let h = harness(Arc::new(InMemoryJobRepository::new()), analyzer);
        let job = queued_job(&h.repo, &["AAPL", "MSFT", "TSLA"]).await;
        let id = job.id;

        h.orchestrator.submit(job).await.unwrap();
        h.orchestrator.registry().wait_all().await;

        let stored = stored_job(&h.repo, id).await;
        assert_eq!(stored.status(), JobState::Failed);
        assert_eq!(stored.completed(), 1);
        assert!(stored.errors().iter().any(|e| e.error.contains("worker panicked")));
        assert!(!h.orchestrator.registry().is_running(id));
    }

    #[tokio::test]
    async fn test_exhausted_result_writes_become_storage_warnings() {
        let repo = Arc::new(BrokenResultsRepo {
            inner: InMemoryJobRepository::new(),
            save_attempts: AtomicU32::new(0),
        });
        let h = harness(repo.clone(), ScriptedAnalyzer::failing(Vec::new()));
        let job = queued_job(&h.repo, &["AAPL", "MSFT"]).await;
        let id = job.id;

        h.orchestrator.submit(job).await.unwrap();
        h.orchestrator.registry().wait_all().await;

        let stored = stored_job(&h.repo, id).await;
        assert_eq!(stored.status(), JobState::Completed);
        assert_eq!(stored.successful(), 2);
        assert_eq!(stored.storage_warnings().len(), 2);
        assert!(stored
            .storage_warnings()
            .iter()
            .all(|w| w.operation == "save_result"));
        assert_eq!(repo.save_attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_zero_timeout_times_out_before_first_ticker() {
        let h = harness(Arc::new(InMemoryJobRepository::new()), ScriptedAnalyzer::failing(Vec::new()));
        let orchestrator = h.orchestrator.clone().with_job_timeout(Duration::ZERO);
        let job = queued_job(&h.repo, &["AAPL"]).await;
        let id = job.id;

        orchestrator.submit(job).await.unwrap();
        orchestrator.registry().wait_all().await;

        let stored = stored_job(&h.repo, id).await;
        assert_eq!(stored.status(), JobState::Timeout);
        assert_eq!(stored.completed(), 0);
    }

    #[tokio::test]
    async fn test_second_submit_of_running_job_is_rejected() {
        let analyzer = ScriptedAnalyzer {
            failing: Vec::new(),
            panicking: Vec::new(),
            delay: Duration::from_millis(50),
        };
        let h = harness(Arc::new(InMemoryJobRepository::new()), analyzer);
        let job = queued_job(&h.repo, &["AAPL"]).await;
        let copy = job.clone();

        assert!(h.orchestrator.submit(job).await.unwrap());
        assert!(!h.orchestrator.submit(copy).await.unwrap());
        h.orchestrator.registry().wait_all().await;
    }

    #[tokio::test]
    async fn test_submit_requires_queued_job() {
        let h = harness(Arc::new(InMemoryJobRepository::new()), ScriptedAnalyzer::failing(Vec::new()));
        let job = AnalysisJob::new(parse_tickers(&["AAPL"]).unwrap(), 10_000.0, None, true).unwrap();

        assert!(matches!(h.orchestrator.submit(job).await, Err(AppError::Transition(_))));
        assert_eq!(h.orchestrator.registry().active_count(), 0);
    }
}
