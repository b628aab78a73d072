use crate::services::retry::RetryPolicy;
use crate::services::ServiceOptions;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    Redis,
}

impl FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StateBackend::Memory),
            "redis" => Ok(StateBackend::Redis),
            other => Err(format!("Unknown JOB_STATE_BACKEND '{}', expected 'memory' or 'redis'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub job_state_backend: String,
    pub redis_url: Option<String>,
    pub job_state_ttl: Duration,
    pub duplicate_window: Duration,
    pub duplicate_lookup_attempts: u32,
    pub storage_retry_attempts: u32,
    pub storage_retry_backoff: Duration,
    pub job_timeout: Duration,
    pub bulk_max_workers: usize,
    pub default_capital: f64,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,
    pub analyze_tickers: Vec<String>,
    pub bulk_tickers: Vec<String>,
    pub demo_data: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|value| parse_list(&value))
        .unwrap_or_default()
}

/// Split a comma-separated list, dropping blanks
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            job_state_backend: std::env::var("JOB_STATE_BACKEND")
                .unwrap_or_else(|_| "memory".to_string()),
            redis_url: std::env::var("REDIS_URL").ok(),
            job_state_ttl: Duration::from_secs(env_or("JOB_STATE_TTL_SECS", 86_400)),
            duplicate_window: Duration::from_secs(env_or("DUPLICATE_WINDOW_SECS", 300)),
            duplicate_lookup_attempts: env_or("DUPLICATE_LOOKUP_ATTEMPTS", 3),
            storage_retry_attempts: env_or("STORAGE_RETRY_ATTEMPTS", 3),
            storage_retry_backoff: Duration::from_millis(env_or("STORAGE_RETRY_BACKOFF_MS", 400)),
            job_timeout: Duration::from_secs(env_or("JOB_TIMEOUT_SECS", 1_800)),
            bulk_max_workers: env_or("BULK_MAX_WORKERS", 5),
            default_capital: env_or("DEFAULT_CAPITAL", 100_000.0),
            cache_max_size: env_or("CACHE_MAX_SIZE", 1_000),
            cache_ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 300)),
            analyze_tickers: env_list("ANALYZE_TICKERS"),
            bulk_tickers: env_list("BULK_TICKERS"),
            demo_data: env_or("DEMO_DATA", true),
        }
    }

    pub fn state_backend(&self) -> Result<StateBackend, String> {
        self.job_state_backend.parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        let backend = self.state_backend()?;
        if backend == StateBackend::Redis && self.redis_url.is_none() {
            return Err("JOB_STATE_BACKEND is redis but REDIS_URL is not set".to_string());
        }
        if self.database_max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be at least 1".to_string());
        }
        if self.duplicate_lookup_attempts == 0 || self.storage_retry_attempts == 0 {
            return Err("Retry attempt counts must be at least 1".to_string());
        }
        if self.bulk_max_workers == 0 {
            return Err("BULK_MAX_WORKERS must be at least 1".to_string());
        }
        if !self.default_capital.is_finite() || self.default_capital <= 0.0 {
            return Err(format!("DEFAULT_CAPITAL must be positive, got {}", self.default_capital));
        }
        if self.job_timeout.is_zero() {
            return Err("JOB_TIMEOUT_SECS must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            duplicate_window: self.duplicate_window,
            duplicate_lookup_attempts: self.duplicate_lookup_attempts,
            duplicate_backoff: RetryPolicy::new(self.duplicate_lookup_attempts, Duration::from_millis(100)),
            storage_retry: RetryPolicy::new(self.storage_retry_attempts, self.storage_retry_backoff),
            job_timeout: self.job_timeout,
            bulk_workers: self.bulk_max_workers,
            bulk_capital: self.default_capital,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EngineConfig {
        EngineConfig {
            database_url: None,
            database_max_connections: 10,
            job_state_backend: "memory".to_string(),
            redis_url: None,
            job_state_ttl: Duration::from_secs(86_400),
            duplicate_window: Duration::from_secs(300),
            duplicate_lookup_attempts: 3,
            storage_retry_attempts: 3,
            storage_retry_backoff: Duration::from_millis(400),
            job_timeout: Duration::from_secs(1_800),
            bulk_max_workers: 5,
            default_capital: 100_000.0,
            cache_max_size: 1_000,
            cache_ttl: Duration::from_secs(300),
            analyze_tickers: Vec::new(),
            bulk_tickers: Vec::new(),
            demo_data: true,
        }
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("memory".parse::<StateBackend>(), Ok(StateBackend::Memory));
        assert_eq!(" Redis ".parse::<StateBackend>(), Ok(StateBackend::Redis));
        assert!("etcd".parse::<StateBackend>().is_err());
    }

    #[test]
    fn test_parse_list_drops_blanks() {
        assert_eq!(parse_list("AAPL, msft,, TCS.NS "), vec!["AAPL", "msft", "TCS.NS"]);
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());

        let mut redis_without_url = base();
        redis_without_url.job_state_backend = "redis".to_string();
        assert!(redis_without_url.validate().is_err());

        let mut bad_backend = base();
        bad_backend.job_state_backend = "etcd".to_string();
        assert!(bad_backend.validate().is_err());

        let mut no_workers = base();
        no_workers.bulk_max_workers = 0;
        assert!(no_workers.validate().is_err());
    }

    #[test]
    fn test_service_options_mapping() {
        let options = base().service_options();
        assert_eq!(options.storage_retry.max_attempts, 3);
        assert_eq!(options.storage_retry.base_delay, Duration::from_millis(400));
        assert_eq!(options.duplicate_window, Duration::from_secs(300));
        assert_eq!(options.bulk_workers, 5);
    }
}
