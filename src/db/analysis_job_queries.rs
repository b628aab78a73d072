use crate::db::{ActiveJob, JobProgress, JobRepository};
use crate::errors::StorageError;
use crate::models::{AnalysisResultRow, JobRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Insert a job unless an active job with the same fingerprint exists inside
/// the window. Same-fingerprint creators are serialized by a
/// transaction-scoped advisory lock. Returns `false` when a duplicate exists.
pub async fn insert_job_unless_duplicate(
    pool: &PgPool,
    job: &JobRecord,
    active_since: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&job.ticker_fingerprint)
        .execute(&mut *tx)
        .await?;

    let existing: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM analysis_jobs
        WHERE ticker_fingerprint = $1
          AND status IN ('queued', 'running')
          AND created_at >= $2
        LIMIT 1
        "#,
    )
    .bind(&job.ticker_fingerprint)
    .bind(active_since)
    .fetch_optional(&mut *tx)
    .await?;

    if existing.is_some() {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO analysis_jobs
            (id, status, tickers, ticker_fingerprint, capital, indicators, demo,
             total, completed, successful, errors, storage_warnings,
             created_at, started_at, completed_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
        "#,
    )
    .bind(job.id)
    .bind(&job.status)
    .bind(&job.tickers)
    .bind(&job.ticker_fingerprint)
    .bind(job.capital)
    .bind(&job.indicators)
    .bind(job.demo)
    .bind(job.total)
    .bind(job.completed)
    .bind(job.successful)
    .bind(&job.errors)
    .bind(&job.storage_warnings)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Overwrite the mutable columns of a job. Returns rows affected.
pub async fn update_job(pool: &PgPool, job: &JobRecord) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = $2,
            completed = $3,
            successful = $4,
            errors = $5,
            storage_warnings = $6,
            started_at = $7,
            completed_at = $8,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(&job.status)
    .bind(job.completed)
    .bind(job.successful)
    .bind(&job.errors)
    .bind(&job.storage_warnings)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn update_job_progress(
    pool: &PgPool,
    job_id: Uuid,
    progress: JobProgress,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET completed = $2,
            successful = $3,
            progress_percent = $4,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(progress.completed)
    .bind(progress.successful)
    .bind(progress.progress_percent)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn fetch_job(pool: &PgPool, job_id: Uuid) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(
        r#"
        SELECT id, status, tickers, ticker_fingerprint, capital, indicators, demo,
               total, completed, successful, errors, storage_warnings,
               created_at, started_at, completed_at
        FROM analysis_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_active_jobs_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<ActiveJob>, sqlx::Error> {
    sqlx::query_as::<_, ActiveJob>(
        r#"
        SELECT id, status, ticker_fingerprint, created_at
        FROM analysis_jobs
        WHERE status IN ('queued', 'running')
          AND created_at >= $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await
}

pub async fn insert_result(pool: &PgPool, row: &AnalysisResultRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO analysis_results (id, job_id, ticker, status, result, error, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(row.id)
    .bind(row.job_id)
    .bind(&row.ticker)
    .bind(&row.status)
    .bind(&row.result)
    .bind(&row.error)
    .bind(row.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn fetch_results_for_job(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<AnalysisResultRow>, sqlx::Error> {
    sqlx::query_as::<_, AnalysisResultRow>(
        r#"
        SELECT id, job_id, ticker, status, result, error, created_at
        FROM analysis_results
        WHERE job_id = $1
        ORDER BY created_at
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Postgres-backed [`JobRepository`]. Every call checks a connection out of
/// the pool for its own duration.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert_job(&self, job: &JobRecord, active_since: DateTime<Utc>) -> Result<(), StorageError> {
        if insert_job_unless_duplicate(&self.pool, job, active_since).await? {
            Ok(())
        } else {
            Err(StorageError::AlreadyExists(format!(
                "active job for {}",
                job.ticker_fingerprint
            )))
        }
    }

    async fn update_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        match update_job(&self.pool, job).await? {
            0 => Err(StorageError::Permanent(format!("job {} does not exist", job.id))),
            _ => Ok(()),
        }
    }

    async fn update_job_progress(&self, job_id: Uuid, progress: JobProgress) -> Result<(), StorageError> {
        match update_job_progress(&self.pool, job_id, progress).await? {
            0 => Err(StorageError::Permanent(format!("job {} does not exist", job_id))),
            _ => Ok(()),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StorageError> {
        Ok(fetch_job(&self.pool, job_id).await?)
    }

    async fn find_active_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<ActiveJob>, StorageError> {
        Ok(fetch_active_jobs_since(&self.pool, since).await?)
    }

    async fn save_result(&self, row: &AnalysisResultRow) -> Result<(), StorageError> {
        Ok(insert_result(&self.pool, row).await?)
    }

    async fn list_results(&self, job_id: Uuid) -> Result<Vec<AnalysisResultRow>, StorageError> {
        Ok(fetch_results_for_job(&self.pool, job_id).await?)
    }
}
