pub mod analysis_job_service;
pub mod bulk_fanout;
pub mod duplicate_job_guard;
pub mod indicator_cache;
pub mod job_orchestrator;
pub mod job_registry;
pub mod job_state_machine;
pub mod job_state_store;
pub mod redis_job_state_store;
pub mod retry;
pub mod ticker_analyzer;

pub use analysis_job_service::{AnalysisJobService, ServiceOptions};
pub use indicator_cache::IndicatorResultCache;
pub use job_registry::JobRegistry;
pub use job_state_store::{InMemoryJobStateStore, JobStateStore};
pub use redis_job_state_store::RedisJobStateStore;
pub use ticker_analyzer::{DemoAnalyzer, TickerAnalyzer};
