//! Production runtime: batch loop + stuck monitor on independent timers.
//!
//! Multiple instances of this process may run against the same database;
//! claim atomicity in the store keeps them from stepping on each other.

use lineageflow::sources::DataSource;
use lineageflow::{
    BoxError, IndexApiClient, LedgerApiClient, LineageStore, PipelineConfig, PipelineMode,
    PipelineOrchestrator, QueueSynchronizer, RankingEngine, RateLimiter, SqliteKvStore,
    SqliteLineageStore, StuckMonitor, WarehouseClient,
};
use std::sync::Arc;
use tokio::time::{interval, Duration};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // NOTE: Workaround for rustls issue
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Can't set crypto provider to aws_lc_rs");

    let env_config = PipelineConfig::from_env();

    log::info!("🚀 Starting LineageFlow pipeline runtime...");
    log::info!("📊 Configuration:");
    log::info!("   Database: {}", env_config.db_path);
    log::info!("   Network: {}", env_config.network_id);
    log::info!("   Mode: {}", env_config.pipeline_mode.as_str());
    log::info!(
        "   Batch: {} records every {}s (pool {})",
        env_config.batch_size,
        env_config.batch_interval_secs,
        env_config.max_concurrent
    );
    log::info!(
        "   Cost guard: ${:.2} / {:.0} MB",
        env_config.cost_limit_usd,
        env_config.size_limit_mb
    );

    let store = Arc::new(SqliteLineageStore::open(&env_config.db_path)?);
    store.ensure_config_row(&env_config).await?;

    let kv = Arc::new(SqliteKvStore::open(&env_config.db_path)?);
    let limiter = Arc::new(RateLimiter::new(kv, &env_config));
    let queue_sync = Arc::new(QueueSynchronizer::new(
        store.clone(),
        env_config.cache_ttl_secs,
    ));
    let ranking = Arc::new(RankingEngine::new(store.clone()));

    let warehouse: Option<Arc<dyn DataSource>> = match env_config.pipeline_mode {
        PipelineMode::ApiOnly => None,
        _ => Some(Arc::new(WarehouseClient::new(
            &env_config.warehouse_base_url,
            env_config.warehouse_price_per_tib_usd,
            env_config.warehouse_row_limit,
        )?)),
    };
    let ledger: Arc<dyn DataSource> = Arc::new(LedgerApiClient::new(
        &env_config.ledger_base_url,
        env_config.ledger_page_limit,
    )?);
    let index: Arc<dyn DataSource> = Arc::new(IndexApiClient::new(&env_config.index_base_url)?);

    let orchestrator = PipelineOrchestrator::new(
        store.clone(),
        queue_sync,
        limiter,
        ranking,
        warehouse,
        ledger,
        index,
    );
    let monitor = StuckMonitor::new(store.clone(), env_config.clone());

    let mut batch_timer = interval(Duration::from_secs(env_config.batch_interval_secs));
    let mut monitor_timer = interval(Duration::from_secs(env_config.monitor_interval_secs));

    loop {
        tokio::select! {
            _ = batch_timer.tick() => {
                // Pick up administrative tuning before every batch.
                let config = match store.load_config(&env_config).await {
                    Ok(config) => config,
                    Err(e) => {
                        log::warn!("⚠️  Could not load tuned config, using env defaults: {}", e);
                        env_config.clone()
                    }
                };
                if let Err(e) = orchestrator.run_batch(&config).await {
                    log::error!("❌ Batch failed: {}", e);
                }
            }

            _ = monitor_timer.tick() => {
                let now = chrono::Utc::now().timestamp();
                match monitor.run_once(now).await {
                    Ok((0, 0)) => {}
                    Ok((requeued, failed)) => {
                        log::info!("🔄 Stuck pass: {} requeued, {} failed", requeued, failed);
                    }
                    Err(e) => log::error!("❌ Stuck scan failed: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                log::info!("👋 Shutdown requested; in-flight claims will be reclaimed by the stuck monitor");
                break;
            }
        }
    }

    Ok(())
}
