pub mod analysis_job;
pub mod analysis_result;
pub mod job_state;
pub mod ticker;

pub use analysis_job::{AnalysisJob, JobErrorEntry, JobRecord, JobSnapshot, StorageWarning};
pub use analysis_result::{AnalysisResult, AnalysisResultRow, IndicatorVote, ResultStatus, Signal};
pub use job_state::{JobEvent, JobState, StateTransition};
pub use ticker::Ticker;
