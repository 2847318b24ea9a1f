//! One-shot batch entry point for external schedulers (cron, systemd
//! timers). Runs one stuck-monitor pass and one orchestrator batch, prints
//! the tallies, and exits.

use lineageflow::sources::DataSource;
use lineageflow::{
    BoxError, IndexApiClient, LedgerApiClient, LineageStore, PipelineConfig, PipelineMode,
    PipelineOrchestrator, QueueSynchronizer, RankingEngine, RateLimiter, SqliteKvStore,
    SqliteLineageStore, StuckMonitor, WarehouseClient,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Can't set crypto provider to aws_lc_rs");

    let env_config = PipelineConfig::from_env();
    let store = Arc::new(SqliteLineageStore::open(&env_config.db_path)?);
    store.ensure_config_row(&env_config).await?;
    let config = store.load_config(&env_config).await?;

    let monitor = StuckMonitor::new(store.clone(), config.clone());
    let (requeued, failed) = monitor.run_once(chrono::Utc::now().timestamp()).await?;
    if requeued + failed > 0 {
        log::info!("🔄 Stuck pass: {} requeued, {} failed", requeued, failed);
    }

    let kv = Arc::new(SqliteKvStore::open(&config.db_path)?);
    let limiter = Arc::new(RateLimiter::new(kv, &config));
    let queue_sync = Arc::new(QueueSynchronizer::new(store.clone(), config.cache_ttl_secs));
    let ranking = Arc::new(RankingEngine::new(store.clone()));

    let warehouse: Option<Arc<dyn DataSource>> = match config.pipeline_mode {
        PipelineMode::ApiOnly => None,
        _ => Some(Arc::new(WarehouseClient::new(
            &config.warehouse_base_url,
            config.warehouse_price_per_tib_usd,
            config.warehouse_row_limit,
        )?)),
    };
    let ledger: Arc<dyn DataSource> = Arc::new(LedgerApiClient::new(
        &config.ledger_base_url,
        config.ledger_page_limit,
    )?);
    let index: Arc<dyn DataSource> = Arc::new(IndexApiClient::new(&config.index_base_url)?);

    let orchestrator = PipelineOrchestrator::new(
        store, queue_sync, limiter, ranking, warehouse, ledger, index,
    );

    let result = orchestrator.run_batch(&config).await?;
    log::info!(
        "✅ Batch complete: {} processed, {} failed, {} skipped",
        result.processed,
        result.failed,
        result.skipped
    );
    Ok(())
}
