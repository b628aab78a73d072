use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Direction suggested by the weighted indicator vote
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "buy"),
            Signal::Sell => write!(f, "sell"),
            Signal::Hold => write!(f, "hold"),
        }
    }
}

/// One indicator's contribution to the score; `vote` is in [-1, 1]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorVote {
    pub indicator: String,
    pub vote: f64,
    pub weight: f64,
}

/// Output of a single-ticker analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub ticker: String,
    pub signal: Signal,
    /// Weighted average of the votes, in [-1, 1]
    pub score: f64,
    /// Agreement between indicators, in [0, 1]
    pub confidence: f64,
    pub votes: Vec<IndicatorVote>,
    pub position_size: f64,
    pub demo: bool,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Completed => write!(f, "completed"),
            ResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted per-ticker outcome (`analysis_results` table). Failures are
/// stored as data with the error message, never raised.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct AnalysisResultRow {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub ticker: String,
    pub status: String,
    pub result: Option<Json<AnalysisResult>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResultRow {
    pub fn completed(job_id: Option<Uuid>, result: AnalysisResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            ticker: result.ticker.clone(),
            status: ResultStatus::Completed.to_string(),
            result: Some(Json(result)),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(job_id: Option<Uuid>, ticker: &str, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            ticker: ticker.to_string(),
            status: ResultStatus::Failed.to_string(),
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResultStatus::Failed.to_string()
    }
}
