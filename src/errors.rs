use crate::models::job_state::{JobEvent, JobState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Job state store error: {0}")]
    StateStore(#[from] StateStoreError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("Job not found: {0}")]
    NotFound(Uuid),
    #[error("Job creation failed: {0}")]
    CreationFailed(String),
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::Storage(StorageError::from(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot apply '{event}' to a job in state '{from}'")]
    InvalidTransition { from: JobState, event: JobEvent },
    #[error("job is in terminal state '{0}'")]
    TerminalState(JobState),
    #[error("cannot apply '{0}' before the job is created")]
    NotCreated(JobEvent),
}

/// Repository failures, split by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

// Postgres SQLSTATEs worth retrying: serialization_failure, deadlock_detected,
// lock_not_available, too_many_connections, admin_shutdown.
const TRANSIENT_SQLSTATES: [&str; 5] = ["40001", "40P01", "55P03", "53300", "57P01"];

impl From<sqlx::Error> for StorageError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::AlreadyExists(db.message().to_string())
            }
            sqlx::Error::Database(db) => {
                let transient = db
                    .code()
                    .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
                    .unwrap_or(false);
                if transient {
                    StorageError::Transient(value.to_string())
                } else {
                    StorageError::Permanent(value.to_string())
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StorageError::Transient(value.to_string()),
            _ => StorageError::Permanent(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Permanent(format!("serialization: {}", value))
    }
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by a ticker analyzer. Always absorbed per ticker by the
/// orchestrator and bulk coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("market data unavailable for {0}")]
    DataUnavailable(String),
    #[error("invalid analysis input: {0}")]
    InvalidInput(String),
}
