//! Account state store: persistence for lineage records, the search cache,
//! standing-change events, and the administratively-tuned config row.
//!
//! The store is the only shared mutable resource (together with the rate
//! limiter's KV backing) and every cross-process invariant is enforced here
//! through conditional writes, not through process-local locks.

pub mod sqlite;

use crate::config::{BatchOutcome, PipelineConfig};
use crate::types::{
    AccountFacts, CacheStatus, CreatorLookup, LineageRecord, LineageStatus, RecordOrigin,
    SearchCacheRecord, StandingChangeEvent,
};
use async_trait::async_trait;

use crate::BoxError;

pub use sqlite::SqliteLineageStore;

/// Persistence contract for the lineage pipeline.
///
/// Implementations enforce transition validity: phases advance strictly in
/// order (with resume-at-cursor after a reset), terminal states are reachable
/// only from in-flight ones, and the only regression path is
/// `return_to_pending` (retry / stuck reset). "Already exists" is never an
/// error; storage I/O failures always are.
#[async_trait]
pub trait LineageStore: Send + Sync {
    /// Idempotent insert-if-absent of a new PENDING record. Returns true when
    /// a row was created, false when one already existed. Never overwrites an
    /// existing record's status.
    async fn enqueue(
        &self,
        account_id: &str,
        network_id: &str,
        origin: RecordOrigin,
    ) -> Result<bool, BoxError>;

    async fn get(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<LineageRecord>, BoxError>;

    /// Oldest-first PENDING batch. Creation time is the only ordering
    /// guarantee; ties break on account_id for determinism.
    async fn due_pending(
        &self,
        network_id: &str,
        limit: usize,
    ) -> Result<Vec<LineageRecord>, BoxError>;

    /// Atomically claim a PENDING record for processing (compare-and-set on
    /// status). Returns the claimed record, or None when another worker
    /// already holds it. This is the at-most-one-concurrent-processing
    /// guarantee; no lock is held across I/O.
    async fn try_claim(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<LineageRecord>, BoxError>;

    /// Persist a completed phase: merge partial facts, optionally record the
    /// creator outcome, and advance the status. Rejects transitions that
    /// `LineageStatus::can_advance_to` disallows.
    async fn advance_phase(
        &self,
        account_id: &str,
        network_id: &str,
        new_status: LineageStatus,
        facts: &AccountFacts,
        creator: Option<&CreatorLookup>,
    ) -> Result<(), BoxError>;

    /// Terminal success: merge final facts, stamp the adapter family that
    /// produced them, clear the in-flight bookkeeping.
    async fn complete(
        &self,
        account_id: &str,
        network_id: &str,
        facts: &AccountFacts,
        pipeline_source: &str,
    ) -> Result<(), BoxError>;

    /// Terminal failure.
    async fn fail(&self, account_id: &str, network_id: &str, error: &str) -> Result<(), BoxError>;

    /// Terminal: upstream authoritatively reported the account does not
    /// exist. Excluded from all future scans.
    async fn mark_invalid(
        &self,
        account_id: &str,
        network_id: &str,
        reason: &str,
    ) -> Result<(), BoxError>;

    /// The only status regression: increment retry_count, clear
    /// processing_started_at, and return an in-flight record to PENDING so it
    /// can be re-claimed. Used by the transient-error path and the stuck
    /// monitor's reset.
    async fn return_to_pending(
        &self,
        account_id: &str,
        network_id: &str,
        error: &str,
    ) -> Result<(), BoxError>;

    /// Every in-flight record, for the stuck scan. Terminal states are never
    /// returned.
    async fn inflight_records(&self, network_id: &str) -> Result<Vec<LineageRecord>, BoxError>;

    // --- search cache -----------------------------------------------------

    /// Create or refresh a cache entry. Called by the external search layer;
    /// exposed here so tests and the promotion path share one code path.
    async fn upsert_cache_entry(
        &self,
        account_id: &str,
        network_id: &str,
        status: CacheStatus,
    ) -> Result<(), BoxError>;

    async fn get_cache_entry(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<SearchCacheRecord>, BoxError>;

    /// Cache entries waiting for promotion into the lineage queue.
    async fn pending_cache_entries(
        &self,
        network_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchCacheRecord>, BoxError>;

    /// Write a mirrored status (and optional serialized result) to the cache
    /// entry. Returns false when no entry exists (a no-op, not an error).
    async fn update_cache_status(
        &self,
        account_id: &str,
        network_id: &str,
        status: CacheStatus,
        result_summary: Option<&str>,
    ) -> Result<bool, BoxError>;

    // --- rankings ---------------------------------------------------------

    /// Records qualifying for a leaderboard at the given balance threshold.
    async fn records_with_balance_at_least(
        &self,
        network_id: &str,
        threshold: f64,
    ) -> Result<Vec<LineageRecord>, BoxError>;

    /// Append-only standing-change log.
    async fn append_standing_change(&self, event: &StandingChangeEvent) -> Result<(), BoxError>;

    /// Latest prior event for this account+threshold, if any.
    async fn latest_standing_change(
        &self,
        account_id: &str,
        network_id: &str,
        threshold: f64,
    ) -> Result<Option<StandingChangeEvent>, BoxError>;

    // --- config row -------------------------------------------------------

    /// Insert the singleton config row if absent, seeded from env defaults.
    async fn ensure_config_row(&self, defaults: &PipelineConfig) -> Result<(), BoxError>;

    /// Env config overlaid with the administratively-tuned row.
    async fn load_config(&self, base: &PipelineConfig) -> Result<PipelineConfig, BoxError>;

    /// Monitoring fields written after each batch; the core never writes the
    /// tuning fields.
    async fn record_batch_outcome(&self, outcome: &BatchOutcome) -> Result<(), BoxError>;
}
