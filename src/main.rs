use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tradesignal_backend::config::{EngineConfig, StateBackend};
use tradesignal_backend::db::{InMemoryJobRepository, JobRepository, PgJobRepository};
use tradesignal_backend::logging::{init_logging, LoggingConfig};
use tradesignal_backend::services::{
    AnalysisJobService, DemoAnalyzer, IndicatorResultCache, InMemoryJobStateStore, JobRegistry,
    JobStateStore, RedisJobStateStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    init_logging(&LoggingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let config = EngineConfig::from_env();
    config.validate().map_err(anyhow::Error::msg)?;

    let repo: Arc<dyn JobRepository> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            info!("🗄️ Using Postgres job repository");
            Arc::new(PgJobRepository::new(pool))
        }
        None => {
            warn!("⚠️ DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(InMemoryJobRepository::new())
        }
    };

    let state_store: Arc<dyn JobStateStore> = match config.state_backend().map_err(anyhow::Error::msg)? {
        StateBackend::Memory => {
            info!("📊 Using in-memory job state store");
            Arc::new(InMemoryJobStateStore::with_ttl(config.job_state_ttl))
        }
        StateBackend::Redis => {
            let redis_url = config.redis_url.as_deref().context("REDIS_URL is not set")?;
            Arc::new(RedisJobStateStore::connect(redis_url, config.job_state_ttl).await?)
        }
    };

    let cache = Arc::new(IndicatorResultCache::new(config.cache_max_size, config.cache_ttl));
    let analyzer = Arc::new(DemoAnalyzer::new(cache.clone()));
    let service = AnalysisJobService::new(
        repo,
        state_store.clone(),
        analyzer,
        JobRegistry::new(),
        config.service_options(),
    );

    let sweeper = {
        let cache = cache.clone();
        let state_store = state_store.clone();
        let period = config.cache_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    debug!("🧹 Removed {} expired indicator cache entries", removed);
                }
                match state_store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!("🧹 Removed {} expired job snapshots", purged),
                    Err(e) => warn!("Job state sweep failed: {}", e),
                }
            }
        })
    };

    let mut one_shot_job = None;
    if !config.analyze_tickers.is_empty() {
        let created = service
            .create_job(&config.analyze_tickers, config.default_capital, None, config.demo_data)
            .await?;
        info!(
            "📨 Job {} for {} ticker(s) is {}{}",
            created.job_id,
            config.analyze_tickers.len(),
            created.status,
            if created.is_duplicate { " (duplicate)" } else { "" }
        );
        one_shot_job = Some(created.job_id);
    }

    if !config.bulk_tickers.is_empty() {
        let summary = service
            .run_bulk(&config.bulk_tickers, config.demo_data, Some(config.bulk_max_workers))
            .await;
        info!(
            "📦 Bulk run resolved {}/{} ticker(s), {} successful",
            summary.completed, summary.requested, summary.successful
        );
    }

    if one_shot_job.is_some() || !config.bulk_tickers.is_empty() {
        tokio::select! {
            _ = service.shutdown() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested, waiting for running jobs");
                service.shutdown().await;
            }
        }
    } else {
        info!("👷 Analysis worker idle, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("🛑 Shutdown requested, waiting for running jobs");
        service.shutdown().await;
    }

    if let Some(job_id) = one_shot_job {
        let status = service.get_status(job_id).await?;
        info!(
            "🏁 Job {} finished as {}: {}/{} successful, {} error(s)",
            job_id,
            status.status,
            status.successful,
            status.total,
            status.errors.len()
        );
    }

    sweeper.abort();
    let stats = cache.stats();
    info!(
        "📈 Indicator cache: {} hits, {} misses, hit rate {:.1}%",
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0
    );

    Ok(())
}
