//! Pipeline configuration from environment variables
//!
//! The cost/routing knobs live in a persisted singleton row (see
//! `store::sqlite`) so an administrative surface can tune them without a
//! redeploy; `PipelineConfig::from_env()` provides the defaults that seed
//! that row on first start. The core reads every field and writes only the
//! monitoring fields after each batch.

use std::env;
use std::str::FromStr;

/// Data-source strategy for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Warehouse first; fall back to the API adapters when the cost guard
    /// blocks a query or the warehouse fails.
    SourceWithFallback,
    /// Warehouse only; a cost-guard block is fatal for the record.
    SourceOnly,
    /// API adapters only, never touch the warehouse.
    ApiOnly,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::SourceWithFallback => "source_with_fallback",
            PipelineMode::SourceOnly => "source_only",
            PipelineMode::ApiOnly => "api_only",
        }
    }
}

impl FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_with_fallback" => Ok(PipelineMode::SourceWithFallback),
            "source_only" => Ok(PipelineMode::SourceOnly),
            "api_only" => Ok(PipelineMode::ApiOnly),
            other => Err(format!("unknown pipeline mode: {}", other)),
        }
    }
}

/// Per-service rate ceiling. Window state is shared across worker processes
/// through the KV store, so these are global ceilings, not per-process ones.
#[derive(Debug, Clone, Copy)]
pub struct ServiceLimit {
    /// Maximum calls inside one window.
    pub burst_limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Minimum spacing between consecutive calls, in milliseconds.
    pub min_interval_ms: u64,
}

/// Configuration for the pipeline runtime.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the SQLite database file.
    pub db_path: String,

    /// Network the pipeline operates on (one deployment per network).
    pub network_id: String,

    /// Data-source strategy.
    pub pipeline_mode: PipelineMode,

    /// Warehouse cost guard: maximum estimated query price.
    pub cost_limit_usd: f64,

    /// Warehouse cost guard: maximum estimated bytes scanned, in MiB.
    pub size_limit_mb: f64,

    /// Accounts older than this skip the expensive warehouse historical scan.
    pub instant_query_max_age_days: i64,

    /// Maximum pending records pulled per batch.
    pub batch_size: usize,

    /// Bounded worker pool size within one batch.
    pub max_concurrent: usize,

    /// Resets after this many retries transition the record to FAILED.
    pub max_retry_attempts: i64,

    /// Per-external-call retry cap (exponential backoff between attempts).
    pub call_retry_attempts: u32,

    /// Page size for paginated ledger operation fetches.
    pub ledger_page_limit: u32,

    /// Row cap for warehouse queries.
    pub warehouse_row_limit: u32,

    /// Search-cache freshness window, in seconds.
    pub cache_ttl_secs: i64,

    /// Soft deadline for one batch; work past it is abandoned to the stuck
    /// monitor.
    pub batch_deadline_secs: u64,

    /// Maximum cache entries promoted per queue-sync pass.
    pub sync_max_accounts: usize,

    /// Stuck threshold for search-originated records, in minutes.
    pub stuck_threshold_search_mins: i64,

    /// Stuck threshold for discovery-originated records, in minutes.
    pub stuck_threshold_discovery_mins: i64,

    /// Batch loop interval for the long-running runtime, in seconds.
    pub batch_interval_secs: u64,

    /// Stuck-monitor scan interval for the long-running runtime, in seconds.
    pub monitor_interval_secs: u64,

    /// Warehouse query endpoint.
    pub warehouse_base_url: String,

    /// Warehouse price per TiB scanned, used by the cost guard.
    pub warehouse_price_per_tib_usd: f64,

    /// Ledger-replica REST API endpoint.
    pub ledger_base_url: String,

    /// Third-party indexing API endpoint.
    pub index_base_url: String,

    /// Rate ceilings, one per external service.
    pub warehouse_limit: ServiceLimit,
    pub ledger_limit: ServiceLimit,
    pub index_limit: ServiceLimit,

    /// Balance thresholds (one leaderboard each) for standing-change
    /// detection, comma-separated in the environment.
    pub ranking_thresholds: Vec<f64>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (defaults in parentheses):
    /// - `LINEAGE_DB_PATH` (/var/lib/lineageflow/lineage.db)
    /// - `LINEAGE_NETWORK_ID` (public)
    /// - `PIPELINE_MODE` (source_with_fallback)
    /// - `COST_LIMIT_USD` (1.0), `SIZE_LIMIT_MB` (500)
    /// - `INSTANT_QUERY_MAX_AGE_DAYS` (365)
    /// - `BATCH_SIZE` (25), `MAX_CONCURRENT` (5)
    /// - `MAX_RETRY_ATTEMPTS` (3), `CALL_RETRY_ATTEMPTS` (3)
    /// - `LEDGER_PAGE_LIMIT` (200), `WAREHOUSE_ROW_LIMIT` (1000)
    /// - `CACHE_TTL_SECS` (300), `BATCH_DEADLINE_SECS` (540)
    /// - `SYNC_MAX_ACCOUNTS` (100)
    /// - `STUCK_THRESHOLD_SEARCH_MINS` (30), `STUCK_THRESHOLD_DISCOVERY_MINS` (120)
    /// - `BATCH_INTERVAL_SECS` (60), `MONITOR_INTERVAL_SECS` (300)
    /// - `WAREHOUSE_BASE_URL`, `LEDGER_BASE_URL`, `INDEX_BASE_URL`
    /// - `WAREHOUSE_PRICE_PER_TIB_USD` (6.25)
    /// - `{WAREHOUSE,LEDGER,INDEX}_BURST_LIMIT` / `_WINDOW_SECS` / `_MIN_INTERVAL_MS`
    /// - `RANKING_THRESHOLDS` (1000000)
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("LINEAGE_DB_PATH", "/var/lib/lineageflow/lineage.db"),
            network_id: env_string("LINEAGE_NETWORK_ID", "public"),
            pipeline_mode: env_parse("PIPELINE_MODE", PipelineMode::SourceWithFallback),
            cost_limit_usd: env_parse("COST_LIMIT_USD", 1.0),
            size_limit_mb: env_parse("SIZE_LIMIT_MB", 500.0),
            instant_query_max_age_days: env_parse("INSTANT_QUERY_MAX_AGE_DAYS", 365),
            batch_size: env_parse("BATCH_SIZE", 25),
            max_concurrent: env_parse("MAX_CONCURRENT", 5),
            max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", 3),
            call_retry_attempts: env_parse("CALL_RETRY_ATTEMPTS", 3),
            ledger_page_limit: env_parse("LEDGER_PAGE_LIMIT", 200),
            warehouse_row_limit: env_parse("WAREHOUSE_ROW_LIMIT", 1_000),
            cache_ttl_secs: env_parse("CACHE_TTL_SECS", 300),
            batch_deadline_secs: env_parse("BATCH_DEADLINE_SECS", 540),
            sync_max_accounts: env_parse("SYNC_MAX_ACCOUNTS", 100),
            stuck_threshold_search_mins: env_parse("STUCK_THRESHOLD_SEARCH_MINS", 30),
            stuck_threshold_discovery_mins: env_parse("STUCK_THRESHOLD_DISCOVERY_MINS", 120),
            batch_interval_secs: env_parse("BATCH_INTERVAL_SECS", 60),
            monitor_interval_secs: env_parse("MONITOR_INTERVAL_SECS", 300),
            warehouse_base_url: env_string("WAREHOUSE_BASE_URL", "http://localhost:9050"),
            warehouse_price_per_tib_usd: env_parse("WAREHOUSE_PRICE_PER_TIB_USD", 6.25),
            ledger_base_url: env_string("LEDGER_BASE_URL", "https://horizon.localdomain"),
            index_base_url: env_string("INDEX_BASE_URL", "https://index.localdomain"),
            warehouse_limit: ServiceLimit {
                burst_limit: env_parse("WAREHOUSE_BURST_LIMIT", 10),
                window_secs: env_parse("WAREHOUSE_WINDOW_SECS", 60),
                min_interval_ms: env_parse("WAREHOUSE_MIN_INTERVAL_MS", 1_000),
            },
            ledger_limit: ServiceLimit {
                burst_limit: env_parse("LEDGER_BURST_LIMIT", 60),
                window_secs: env_parse("LEDGER_WINDOW_SECS", 60),
                min_interval_ms: env_parse("LEDGER_MIN_INTERVAL_MS", 200),
            },
            index_limit: ServiceLimit {
                burst_limit: env_parse("INDEX_BURST_LIMIT", 30),
                window_secs: env_parse("INDEX_WINDOW_SECS", 60),
                min_interval_ms: env_parse("INDEX_MIN_INTERVAL_MS", 500),
            },
            ranking_thresholds: env::var("RANKING_THRESHOLDS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .filter_map(|part| part.trim().parse().ok())
                        .collect()
                })
                .filter(|v: &Vec<f64>| !v.is_empty())
                .unwrap_or_else(|| vec![1_000_000.0]),
        }
    }

    pub fn limit_for(&self, kind: crate::types::DataSourceKind) -> ServiceLimit {
        match kind {
            crate::types::DataSourceKind::Warehouse => self.warehouse_limit,
            crate::types::DataSourceKind::Ledger => self.ledger_limit,
            crate::types::DataSourceKind::Index => self.index_limit,
        }
    }

    pub fn stuck_threshold_secs(&self, origin: crate::types::RecordOrigin) -> i64 {
        match origin {
            crate::types::RecordOrigin::Search => self.stuck_threshold_search_mins * 60,
            crate::types::RecordOrigin::Discovery => self.stuck_threshold_discovery_mins * 60,
        }
    }
}

/// Monitoring fields written back to the persisted config row after a batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub run_at: i64,
    pub status: String,
    pub processed: i64,
    pub failed: i64,
    pub skipped: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordOrigin;

    #[test]
    fn test_config_from_env() {
        // One test covers defaults, overrides, and bad values sequentially:
        // cargo runs tests in parallel threads, and these env vars are
        // process-global.
        env::remove_var("PIPELINE_MODE");
        env::remove_var("COST_LIMIT_USD");
        env::remove_var("BATCH_SIZE");
        env::remove_var("RANKING_THRESHOLDS");

        let config = PipelineConfig::from_env();
        assert_eq!(config.pipeline_mode, PipelineMode::SourceWithFallback);
        assert_eq!(config.cost_limit_usd, 1.0);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.ranking_thresholds, vec![1_000_000.0]);

        // Overrides.
        env::set_var("PIPELINE_MODE", "api_only");
        env::set_var("COST_LIMIT_USD", "0.71");
        env::set_var("RANKING_THRESHOLDS", "1000000, 5000000");

        let config = PipelineConfig::from_env();
        assert_eq!(config.pipeline_mode, PipelineMode::ApiOnly);
        assert_eq!(config.cost_limit_usd, 0.71);
        assert_eq!(config.ranking_thresholds, vec![1_000_000.0, 5_000_000.0]);

        // Unparseable values fall back to defaults rather than panicking.
        env::set_var("PIPELINE_MODE", "definitely_not_a_mode");
        let config = PipelineConfig::from_env();
        assert_eq!(config.pipeline_mode, PipelineMode::SourceWithFallback);

        env::remove_var("PIPELINE_MODE");
        env::remove_var("COST_LIMIT_USD");
        env::remove_var("RANKING_THRESHOLDS");
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            PipelineMode::SourceWithFallback,
            PipelineMode::SourceOnly,
            PipelineMode::ApiOnly,
        ] {
            assert_eq!(mode.as_str().parse::<PipelineMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_stuck_threshold_per_origin() {
        env::remove_var("STUCK_THRESHOLD_SEARCH_MINS");
        env::remove_var("STUCK_THRESHOLD_DISCOVERY_MINS");
        let config = PipelineConfig::from_env();

        assert_eq!(config.stuck_threshold_secs(RecordOrigin::Search), 30 * 60);
        assert_eq!(
            config.stuck_threshold_secs(RecordOrigin::Discovery),
            120 * 60
        );
    }
}
