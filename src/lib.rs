//! # LineageFlow
//!
//! Discovers and maintains the creator→child "genealogy" of a blockchain
//! account network. For any account: who created it, and which accounts it
//! created, recursively. Facts are assembled from three rate- and
//! cost-constrained sources and persisted into a durable per-account record
//! that other consumers read.
//!
//! ## Architecture
//!
//! ```text
//! search layer ──▶ search_cache ──▶ QueueSynchronizer ──▶ lineage_records (PENDING)
//!                                                              │
//!                                   PipelineOrchestrator ◀─────┘  (try_claim)
//!                                        │
//!              facts ─▶ creator ─▶ children ─▶ assets   (RateLimiter before
//!                    │                                   every external call)
//!        Warehouse / LedgerAPI / IndexAPI adapters
//!                    │
//!          lineage_records (COMPLETE / INVALID / FAILED)
//!                    │                        │
//!              RankingEngine            sync back to search_cache
//!           (standing_changes)
//! ```
//!
//! Crashed or abandoned work is reclaimed by the `StuckMonitor`; every
//! cross-process invariant (one claim per account, rate ceilings) lives in
//! the shared SQLite store, never in process-local state.
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (LineageRecord, statuses, events)
//! - `config` - Environment-driven configuration + persisted tuning row
//! - `store` - Account state store (state machine persistence, SQLite)
//! - `sources` - Data source adapters (warehouse, ledger API, index API)
//! - `ratelimit` - Cross-process sliding-window rate limiter
//! - `backoff` - Exponential retry backoff for external calls
//! - `queue_sync` - Search-cache <-> lineage queue reconciliation
//! - `orchestrator` - Batch pipeline driver (strategies, cost guard, pool)
//! - `monitor` - Stuck-record detection and recovery
//! - `ranking` - High-value-account leaderboards and standing changes

pub mod backoff;
pub mod config;
pub mod monitor;
pub mod orchestrator;
pub mod queue_sync;
pub mod ranking;
pub mod ratelimit;
pub mod sources;
pub mod store;
pub mod types;

/// Error type used at orchestration boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// Re-export commonly used types
pub use config::{PipelineConfig, PipelineMode};
pub use monitor::StuckMonitor;
pub use orchestrator::PipelineOrchestrator;
pub use queue_sync::QueueSynchronizer;
pub use ranking::RankingEngine;
pub use ratelimit::{MemoryKvStore, RateLimiter, SharedKvStore, SqliteKvStore};
pub use sources::{DataSource, IndexApiClient, LedgerApiClient, SourceError, WarehouseClient};
pub use store::{LineageStore, SqliteLineageStore};
pub use types::{
    AccountFacts, BatchResult, CacheStatus, CreatorLookup, DataSourceKind, LineageRecord,
    LineageStatus, ProcessingPhase, RecordOrigin, SearchCacheRecord, StandingChangeEvent,
    StandingChangeType, StuckInfo,
};
