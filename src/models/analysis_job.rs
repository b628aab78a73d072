use crate::errors::{AppError, StorageError, TransitionError};
use crate::models::job_state::{JobEvent, JobState, StateTransition};
use crate::models::ticker::{ticker_fingerprint, Ticker};
use crate::services::job_state_machine::{JobStateMachine, TransitionHook};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

pub const MAX_TICKERS_PER_JOB: usize = 100;
/// Ticker column used for job-level errors
pub const JOB_ERROR_TICKER: &str = "*";

/// A per-ticker failure recorded on the job instead of aborting it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobErrorEntry {
    pub ticker: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// A storage write that was given up on after its retries were exhausted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageWarning {
    pub ticker: Option<String>,
    pub operation: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Read-only projection of a job, shared through the job state store and
/// returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobState,
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub errors: Vec<JobErrorEntry>,
    #[serde(default)]
    pub storage_warnings: Vec<StorageWarning>,
    pub progress_percent: f64,
    pub ticker_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
}

/// Persisted form of an analysis job (`analysis_jobs` table).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: String,
    pub tickers: Json<Vec<String>>,
    pub ticker_fingerprint: String,
    pub capital: f64,
    pub indicators: Option<Json<Vec<String>>>,
    pub demo: bool,
    pub total: i32,
    pub completed: i32,
    pub successful: i32,
    pub errors: Json<Vec<JobErrorEntry>>,
    pub storage_warnings: Json<Vec<StorageWarning>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate root for one multi-ticker analysis request.
///
/// Counters and status are private: progress only moves through
/// [`AnalysisJob::record_outcome`] and status only through
/// [`AnalysisJob::transition`], which keeps `successful <= completed <= total`.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub id: Uuid,
    tickers: Vec<Ticker>,
    capital: f64,
    indicators: Option<Vec<String>>,
    demo: bool,
    completed: usize,
    successful: usize,
    errors: Vec<JobErrorEntry>,
    storage_warnings: Vec<StorageWarning>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    machine: JobStateMachine,
}

impl AnalysisJob {
    pub fn new(
        tickers: Vec<Ticker>,
        capital: f64,
        indicators: Option<Vec<String>>,
        demo: bool,
    ) -> Result<Self, AppError> {
        validate_tickers(&tickers)?;
        validate_capital(capital)?;

        let indicators = indicators
            .map(|list| {
                list.into_iter()
                    .map(|name| name.trim().to_lowercase())
                    .filter(|name| !name.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty());

        let mut machine = JobStateMachine::new();
        machine.transition(JobEvent::Create, serde_json::json!({ "tickers": tickers.len() }))?;

        Ok(Self {
            id: Uuid::new_v4(),
            tickers,
            capital,
            indicators,
            demo,
            completed: 0,
            successful: 0,
            errors: Vec::new(),
            storage_warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            machine,
        })
    }

    /// Rebuild a job from its stored row. The state machine resumes at the
    /// stored status with an empty history.
    pub fn from_record(record: JobRecord) -> Result<Self, StorageError> {
        let status: JobState = record.status.parse().map_err(StorageError::Permanent)?;
        let tickers = record
            .tickers
            .0
            .iter()
            .map(|s| Ticker::parse(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Permanent)?;

        let (Ok(completed), Ok(successful)) = (usize::try_from(record.completed), usize::try_from(record.successful))
        else {
            return Err(StorageError::Permanent(format!(
                "job {} has negative counters ({}/{})",
                record.id, record.completed, record.successful
            )));
        };
        if successful > completed || completed > tickers.len() {
            return Err(StorageError::Permanent(format!(
                "job {} has inconsistent counters ({}/{}/{})",
                record.id,
                successful,
                completed,
                tickers.len()
            )));
        }

        Ok(Self {
            id: record.id,
            tickers,
            capital: record.capital,
            indicators: record.indicators.map(|json| json.0),
            demo: record.demo,
            completed,
            successful,
            errors: record.errors.0,
            storage_warnings: record.storage_warnings.0,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            machine: JobStateMachine::restored(status),
        })
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            status: self.status().to_string(),
            tickers: Json(self.tickers.iter().map(|t| t.to_string()).collect()),
            ticker_fingerprint: self.fingerprint(),
            capital: self.capital,
            indicators: self.indicators.clone().map(Json),
            demo: self.demo,
            total: self.total() as i32,
            completed: self.completed as i32,
            successful: self.successful as i32,
            errors: Json(self.errors.clone()),
            storage_warnings: Json(self.storage_warnings.clone()),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    pub fn status(&self) -> JobState {
        self.machine.current().unwrap_or(JobState::Created)
    }

    pub fn tickers(&self) -> &[Ticker] {
        &self.tickers
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn indicators(&self) -> Option<&[String]> {
        self.indicators.as_deref()
    }

    pub fn demo(&self) -> bool {
        self.demo
    }

    pub fn total(&self) -> usize {
        self.tickers.len()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn successful(&self) -> usize {
        self.successful
    }

    pub fn errors(&self) -> &[JobErrorEntry] {
        &self.errors
    }

    pub fn storage_warnings(&self) -> &[StorageWarning] {
        &self.storage_warnings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn history(&self) -> &[StateTransition] {
        self.machine.history()
    }

    pub fn fingerprint(&self) -> String {
        ticker_fingerprint(&self.tickers)
    }

    pub fn on_transition(&mut self, from: JobState, to: JobState, hook: TransitionHook) {
        self.machine.on_transition(from, to, hook);
    }

    /// Apply a lifecycle event and the bookkeeping that goes with it.
    pub fn transition(
        &mut self,
        event: JobEvent,
        metadata: serde_json::Value,
    ) -> Result<JobState, TransitionError> {
        let next = self.machine.transition(event, metadata)?;
        let now = Utc::now();

        match event {
            JobEvent::Start => self.started_at = Some(now),
            JobEvent::Complete | JobEvent::Fail | JobEvent::Cancel | JobEvent::Timeout => {
                self.completed_at = Some(now)
            }
            JobEvent::Retry => {
                self.completed = 0;
                self.successful = 0;
                self.errors.clear();
                self.storage_warnings.clear();
                self.started_at = None;
                self.completed_at = None;
            }
            _ => {}
        }

        Ok(next)
    }

    /// Count one processed ticker. `Err(message)` records a per-ticker error
    /// and still counts the ticker as completed.
    pub fn record_outcome(&mut self, ticker: &Ticker, outcome: Result<(), String>) -> Result<(), AppError> {
        if self.completed >= self.total() {
            return Err(AppError::Invariant(format!(
                "job {} already completed {} of {} tickers",
                self.id,
                self.completed,
                self.total()
            )));
        }

        self.completed += 1;
        match outcome {
            Ok(()) => self.successful += 1,
            Err(error) => self.errors.push(JobErrorEntry {
                ticker: ticker.to_string(),
                error,
                timestamp: Utc::now(),
            }),
        }

        Ok(())
    }

    pub fn record_storage_warning(&mut self, ticker: Option<&Ticker>, operation: &str, error: String) {
        self.storage_warnings.push(StorageWarning {
            ticker: ticker.map(|t| t.to_string()),
            operation: operation.to_string(),
            error,
            timestamp: Utc::now(),
        });
    }

    /// Record an error that is not tied to a ticker, e.g. a crashed worker.
    pub fn record_job_error(&mut self, error: String) {
        self.errors.push(JobErrorEntry {
            ticker: JOB_ERROR_TICKER.to_string(),
            error,
            timestamp: Utc::now(),
        });
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        let pct = self.completed as f64 / self.total() as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            status: self.status(),
            total: self.total(),
            completed: self.completed,
            successful: self.successful,
            errors: self.errors.clone(),
            storage_warnings: self.storage_warnings.clone(),
            progress_percent: self.progress_percent(),
            ticker_fingerprint: self.fingerprint(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancel_requested: false,
        }
    }
}

fn validate_tickers(tickers: &[Ticker]) -> Result<(), AppError> {
    if tickers.is_empty() {
        return Err(AppError::Validation("At least one ticker is required".to_string()));
    }
    if tickers.len() > MAX_TICKERS_PER_JOB {
        return Err(AppError::Validation(format!(
            "A job may contain at most {} tickers, got {}",
            MAX_TICKERS_PER_JOB,
            tickers.len()
        )));
    }
    Ok(())
}

fn validate_capital(capital: f64) -> Result<(), AppError> {
    if !capital.is_finite() || capital <= 0.0 {
        return Err(AppError::Validation(format!(
            "Capital must be a positive amount, got {}",
            capital
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ticker::parse_tickers;
    use serde_json::json;

    fn job(symbols: &[&str]) -> AnalysisJob {
        AnalysisJob::new(parse_tickers(symbols).unwrap(), 10_000.0, None, true).unwrap()
    }

    #[test]
    fn test_new_job_is_created() {
        let job = job(&["AAPL", "MSFT"]);
        assert_eq!(job.status(), JobState::Created);
        assert_eq!(job.total(), 2);
        assert_eq!(job.history().len(), 1);
    }

    #[test]
    fn test_rejects_invalid_capital() {
        let tickers = parse_tickers(&["AAPL"]).unwrap();
        for capital in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let result = AnalysisJob::new(tickers.clone(), capital, None, false);
            assert!(matches!(result, Err(AppError::Validation(_))), "capital {}", capital);
        }
    }

    #[test]
    fn test_rejects_empty_and_oversized_ticker_lists() {
        assert!(AnalysisJob::new(Vec::new(), 1.0, None, false).is_err());

        let many: Vec<String> = (0..=MAX_TICKERS_PER_JOB).map(|i| format!("T{}", i)).collect();
        let tickers = parse_tickers(&many).unwrap();
        assert!(AnalysisJob::new(tickers, 1.0, None, false).is_err());
    }

    #[test]
    fn test_indicator_subset_is_normalized() {
        let tickers = parse_tickers(&["AAPL"]).unwrap();
        let job = AnalysisJob::new(tickers.clone(), 1.0, Some(vec![" RSI ".into(), "".into()]), false).unwrap();
        assert_eq!(job.indicators(), Some(&["rsi".to_string()][..]));

        let job = AnalysisJob::new(tickers, 1.0, Some(vec!["  ".into()]), false).unwrap();
        assert_eq!(job.indicators(), None);
    }

    #[test]
    fn test_completed_cannot_exceed_total() {
        let mut job = job(&["AAPL"]);
        let ticker = job.tickers()[0].clone();

        job.record_outcome(&ticker, Ok(())).unwrap();
        let result = job.record_outcome(&ticker, Ok(()));

        assert!(matches!(result, Err(AppError::Invariant(_))));
        assert_eq!(job.completed(), 1);
        assert_eq!(job.successful(), 1);
    }

    #[test]
    fn test_failed_outcome_counts_and_records_error() {
        let mut job = job(&["AAPL", "BAD"]);
        let tickers = job.tickers().to_vec();

        job.record_outcome(&tickers[0], Ok(())).unwrap();
        job.record_outcome(&tickers[1], Err("no data".into())).unwrap();

        assert_eq!(job.completed(), 2);
        assert_eq!(job.successful(), 1);
        assert_eq!(job.errors().len(), 1);
        assert_eq!(job.errors()[0].ticker, "BAD");
        assert_eq!(job.progress_percent(), 100.0);
    }

    #[test]
    fn test_retry_resets_progress() {
        let mut job = job(&["AAPL", "MSFT"]);
        let ticker = job.tickers()[0].clone();

        job.transition(JobEvent::Queue, json!({})).unwrap();
        job.transition(JobEvent::Start, json!({})).unwrap();
        job.record_outcome(&ticker, Err("boom".into())).unwrap();
        job.transition(JobEvent::Fail, json!({"error": "db down"})).unwrap();
        assert!(job.started_at().is_some());
        assert!(job.completed_at().is_some());

        assert_eq!(job.transition(JobEvent::Retry, json!({})), Ok(JobState::Queued));
        assert_eq!(job.completed(), 0);
        assert_eq!(job.successful(), 0);
        assert!(job.errors().is_empty());
        assert!(job.started_at().is_none());
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn test_record_round_trip_preserves_state() {
        let mut job = job(&["TCS.NS", "INFY.NS"]);
        job.transition(JobEvent::Queue, json!({})).unwrap();
        job.transition(JobEvent::Start, json!({})).unwrap();
        let ticker = job.tickers()[0].clone();
        job.record_outcome(&ticker, Ok(())).unwrap();

        let restored = AnalysisJob::from_record(job.to_record()).unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.status(), JobState::Running);
        assert_eq!(restored.completed(), 1);
        assert_eq!(restored.fingerprint(), r#"["INFY.NS","TCS.NS"]"#);
        assert!(restored.history().is_empty());
    }

    #[test]
    fn test_from_record_rejects_inconsistent_counters() {
        let mut record = job(&["AAPL"]).to_record();
        record.completed = 3;
        assert!(AnalysisJob::from_record(record).is_err());
    }

    #[test]
    fn test_from_record_rejects_negative_counters() {
        let mut record = job(&["AAPL", "MSFT"]).to_record();
        record.completed = -1;
        assert!(matches!(
            AnalysisJob::from_record(record),
            Err(StorageError::Permanent(_))
        ));

        let mut record = job(&["AAPL", "MSFT"]).to_record();
        record.successful = -2;
        assert!(AnalysisJob::from_record(record).is_err());
    }
}
