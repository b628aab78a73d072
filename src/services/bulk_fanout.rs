use crate::db::JobRepository;
use crate::models::{AnalysisResultRow, Ticker};
use crate::services::job_state_machine::panic_message;
use crate::services::retry::{retry_storage, RetryPolicy};
use crate::services::ticker_analyzer::TickerAnalyzer;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub const DEFAULT_BULK_WORKERS: usize = 5;
const PROGRESS_LOG_EVERY: usize = 10;

/// Counts for one bulk run. `completed` is every resolved unit, whatever
/// its outcome; `successful + failed == completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub requested: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Runs independent single-ticker analyses on a bounded pool and stores one
/// result row per ticker. Failures become `failed` rows, never errors.
#[derive(Clone)]
pub struct BulkFanoutCoordinator {
    repo: Arc<dyn JobRepository>,
    analyzer: Arc<dyn TickerAnalyzer>,
    retry: RetryPolicy,
    capital: f64,
    default_workers: usize,
}

impl BulkFanoutCoordinator {
    pub fn new(repo: Arc<dyn JobRepository>, analyzer: Arc<dyn TickerAnalyzer>, capital: f64) -> Self {
        Self {
            repo,
            analyzer,
            retry: RetryPolicy::default(),
            capital,
            default_workers: DEFAULT_BULK_WORKERS,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_workers(mut self, workers: usize) -> Self {
        self.default_workers = workers.max(1);
        self
    }

    /// Analyze every ticker with at most `max_workers` in flight and wait for
    /// all of them.
    pub async fn run(&self, tickers: &[String], demo: bool, max_workers: Option<usize>) -> BulkSummary {
        let workers = max_workers.unwrap_or(self.default_workers).max(1);
        let total = tickers.len();
        info!("📦 Bulk analysis of {} ticker(s) with {} worker(s)", total, workers);

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut units = JoinSet::new();

        for raw in tickers {
            let semaphore = semaphore.clone();
            let unit = self.clone();
            let raw = raw.clone();
            units.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                unit.run_unit(&raw, demo).await
            });
        }

        let mut summary = BulkSummary {
            requested: total,
            ..BulkSummary::default()
        };

        while let Some(joined) = units.join_next().await {
            summary.completed += 1;
            match joined {
                Ok(true) => summary.successful += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!("Bulk unit crashed: {}", e);
                    summary.failed += 1;
                }
            }

            if summary.completed % PROGRESS_LOG_EVERY == 0 && summary.completed < total {
                info!(
                    "📦 Bulk progress: {}/{} done ({} ok, {} failed)",
                    summary.completed, total, summary.successful, summary.failed
                );
            }
        }

        info!(
            "✅ Bulk analysis finished: {}/{} ok, {} failed",
            summary.successful, total, summary.failed
        );
        summary
    }

    async fn run_unit(&self, raw: &str, demo: bool) -> bool {
        let (symbol, outcome) = match Ticker::parse(raw) {
            Err(e) => (raw.trim().to_string(), Err(e)),
            Ok(ticker) => {
                let analysis = AssertUnwindSafe(self.analyzer.analyze(&ticker, None, self.capital, demo))
                    .catch_unwind()
                    .await;
                let outcome = match analysis {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(format!("analysis panicked: {}", panic_message(payload.as_ref()))),
                };
                (ticker.to_string(), outcome)
            }
        };

        let (row, ok) = match outcome {
            Ok(result) => (AnalysisResultRow::completed(None, result), true),
            Err(message) => {
                warn!("Bulk analysis of {} failed: {}", symbol, message);
                (AnalysisResultRow::failed(None, &symbol, message), false)
            }
        };

        if let Err(e) = retry_storage(&self.retry, "save_bulk_result", || self.repo.save_result(&row)).await {
            error!("Bulk result for {} was not persisted: {}", symbol, e);
        }
        ok
    }
}
