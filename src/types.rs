//! Core data structures for the lineage pipeline
//!
//! All persisted enums are closed types with `as_str()`/`parse()` round-trips.
//! Status values are never stored as free-form strings; the store rejects
//! anything that does not parse back into these types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Processing status of a lineage record.
///
/// Lifecycle: `Pending` -> `Processing` -> sub-phases (`FactsFetched`,
/// `CreatorResolved`, `ChildrenResolved`) -> one of the terminal states
/// (`Complete`, `Invalid`, `Failed`).
///
/// Sub-phase statuses are persisted so a crash mid-pipeline resumes at the
/// last completed phase instead of restarting from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineageStatus {
    /// Waiting to be claimed by a pipeline worker.
    Pending,
    /// Claimed by a worker, account facts not yet fetched.
    Processing,
    /// Account facts persisted.
    FactsFetched,
    /// Creator discovery persisted.
    CreatorResolved,
    /// Child discovery persisted.
    ChildrenResolved,
    /// All phases done; facts are authoritative.
    Complete,
    /// Upstream authoritatively reported the account does not exist.
    /// Terminal and excluded from all future scans.
    Invalid,
    /// Terminal failure (retry cap, permanent error, cost guard with no
    /// fallback allowed).
    Failed,
}

impl LineageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineageStatus::Pending => "PENDING",
            LineageStatus::Processing => "PROCESSING",
            LineageStatus::FactsFetched => "FACTS_FETCHED",
            LineageStatus::CreatorResolved => "CREATOR_RESOLVED",
            LineageStatus::ChildrenResolved => "CHILDREN_RESOLVED",
            LineageStatus::Complete => "COMPLETE",
            LineageStatus::Invalid => "INVALID",
            LineageStatus::Failed => "FAILED",
        }
    }

    /// Terminal states are never re-claimed, re-scanned, or reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LineageStatus::Complete | LineageStatus::Invalid | LineageStatus::Failed
        )
    }

    /// In-flight states: claimed by a worker, subject to stuck detection.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            LineageStatus::Processing
                | LineageStatus::FactsFetched
                | LineageStatus::CreatorResolved
                | LineageStatus::ChildrenResolved
        )
    }

    /// Valid forward transitions. Regression (back to `Pending`) is only
    /// possible through the stuck-reset path, which is checked separately.
    pub fn can_advance_to(&self, next: LineageStatus) -> bool {
        use LineageStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, FactsFetched) => true,
            (FactsFetched, CreatorResolved) => true,
            (CreatorResolved, ChildrenResolved) => true,
            // Terminal transitions are allowed from any in-flight state so a
            // phase failure can finalize without walking the remaining phases.
            (s, Complete) | (s, Invalid) | (s, Failed) => s.is_in_flight(),
            _ => false,
        }
    }
}

impl FromStr for LineageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(LineageStatus::Pending),
            "PROCESSING" => Ok(LineageStatus::Processing),
            "FACTS_FETCHED" => Ok(LineageStatus::FactsFetched),
            "CREATOR_RESOLVED" => Ok(LineageStatus::CreatorResolved),
            "CHILDREN_RESOLVED" => Ok(LineageStatus::ChildrenResolved),
            "COMPLETE" => Ok(LineageStatus::Complete),
            "INVALID" => Ok(LineageStatus::Invalid),
            "FAILED" => Ok(LineageStatus::Failed),
            other => Err(format!("unknown lineage status: {}", other)),
        }
    }
}

/// Ordered pipeline phases within one account's processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingPhase {
    FetchFacts,
    FindCreator,
    FindChildren,
    FetchAssets,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::FetchFacts => "FETCH_FACTS",
            ProcessingPhase::FindCreator => "FIND_CREATOR",
            ProcessingPhase::FindChildren => "FIND_CHILDREN",
            ProcessingPhase::FetchAssets => "FETCH_ASSETS",
        }
    }

    /// Status persisted when this phase completes. `FetchAssets` completes the
    /// whole record, which goes through `complete()` instead.
    pub fn completed_status(&self) -> Option<LineageStatus> {
        match self {
            ProcessingPhase::FetchFacts => Some(LineageStatus::FactsFetched),
            ProcessingPhase::FindCreator => Some(LineageStatus::CreatorResolved),
            ProcessingPhase::FindChildren => Some(LineageStatus::ChildrenResolved),
            ProcessingPhase::FetchAssets => None,
        }
    }

    pub fn next(&self) -> Option<ProcessingPhase> {
        match self {
            ProcessingPhase::FetchFacts => Some(ProcessingPhase::FindCreator),
            ProcessingPhase::FindCreator => Some(ProcessingPhase::FindChildren),
            ProcessingPhase::FindChildren => Some(ProcessingPhase::FetchAssets),
            ProcessingPhase::FetchAssets => None,
        }
    }
}

impl FromStr for ProcessingPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FETCH_FACTS" => Ok(ProcessingPhase::FetchFacts),
            "FIND_CREATOR" => Ok(ProcessingPhase::FindCreator),
            "FIND_CHILDREN" => Ok(ProcessingPhase::FindChildren),
            "FETCH_ASSETS" => Ok(ProcessingPhase::FetchAssets),
            other => Err(format!("unknown processing phase: {}", other)),
        }
    }
}

/// Which external data source produced a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSourceKind {
    /// Columnar analytics warehouse (batch queries, cost-guarded).
    Warehouse,
    /// Ledger-replica REST API.
    Ledger,
    /// Third-party indexing API.
    Index,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::Warehouse => "warehouse",
            DataSourceKind::Ledger => "ledger",
            DataSourceKind::Index => "index",
        }
    }
}

/// How a lineage record entered the work queue. Drives the per-origin stuck
/// threshold (search-originated work has a tighter SLA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOrigin {
    /// Promoted from the search cache by the queue synchronizer.
    Search,
    /// Discovered as a creator or child during another account's processing.
    Discovery,
}

impl RecordOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOrigin::Search => "search",
            RecordOrigin::Discovery => "discovery",
        }
    }
}

impl FromStr for RecordOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search" => Ok(RecordOrigin::Search),
            "discovery" => Ok(RecordOrigin::Discovery),
            other => Err(format!("unknown record origin: {}", other)),
        }
    }
}

/// Creator discovery outcome.
///
/// `Unknown` is distinct from `Root`: unknown means the source could not see
/// far enough back (pruned history), root means the source authoritatively
/// says the account was not created by another account.
#[derive(Debug, Clone, PartialEq)]
pub enum CreatorLookup {
    Found {
        creator_account_id: String,
        /// Ledger timestamp of the creation operation, when the source has it.
        account_created_at: Option<i64>,
    },
    Root,
    Unknown,
}

/// Normalized facts about one account, as returned by any data source adapter.
///
/// Every field is optional; adapters fill what they know and the store merges
/// non-empty fields over what is already persisted, recording per-field
/// provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountFacts {
    pub balance: Option<f64>,
    pub home_domain: Option<String>,
    pub flags: Option<i64>,
    pub attributes: Option<serde_json::Value>,
    pub assets: Option<serde_json::Value>,
    /// Ledger creation time of the account itself (drives age-based routing).
    pub account_created_at: Option<i64>,
    /// Source that produced these facts.
    pub source: Option<DataSourceKind>,
}

impl AccountFacts {
    pub fn from_source(source: DataSourceKind) -> Self {
        Self {
            source: Some(source),
            ..Default::default()
        }
    }

    /// Names of the fields this batch of facts would overwrite. Used by the
    /// store to update the provenance map.
    pub fn populated_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.balance.is_some() {
            fields.push("balance");
        }
        if self.home_domain.is_some() {
            fields.push("home_domain");
        }
        if self.flags.is_some() {
            fields.push("flags");
        }
        if self.attributes.is_some() {
            fields.push("attributes");
        }
        if self.assets.is_some() {
            fields.push("assets");
        }
        if self.account_created_at.is_some() {
            fields.push("account_created_at");
        }
        fields
    }
}

/// The per-account lineage record. Key: (account_id, network_id), unique and
/// immutable once created. Append-mostly: fields are overwritten, the row is
/// never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRecord {
    pub account_id: String,
    pub network_id: String,
    pub status: LineageStatus,
    /// Creator account, when resolved. `None` with `creator_resolved = false`
    /// means unknown; `None` with `creator_resolved = true` means the account
    /// is a root (no creator).
    pub creator_account_id: Option<String>,
    pub creator_resolved: bool,
    pub balance: Option<f64>,
    pub home_domain: Option<String>,
    pub flags: Option<i64>,
    pub attributes_blob: Option<String>,
    pub assets_blob: Option<String>,
    /// JSON map of field name -> `DataSourceKind` that last wrote it.
    pub provenance: Option<String>,
    /// Adapter family that completed this record ("warehouse" or "api").
    pub pipeline_source: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub processing_started_at: Option<i64>,
    pub last_pipeline_attempt: Option<i64>,
    /// Last completed pipeline phase, kept across stuck resets so a re-claim
    /// resumes instead of restarting.
    pub last_completed_phase: Option<ProcessingPhase>,
    /// Ledger creation time of the account (from facts; age-based routing).
    pub account_created_at: Option<i64>,
    pub origin: RecordOrigin,
    pub created_at: i64,
    pub updated_at: i64,
}

impl LineageRecord {
    /// Phase the next processing run should start at.
    pub fn resume_phase(&self) -> ProcessingPhase {
        match self.last_completed_phase {
            None => ProcessingPhase::FetchFacts,
            Some(phase) => phase.next().unwrap_or(ProcessingPhase::FetchAssets),
        }
    }

    /// Decode the provenance JSON map, tolerating absence.
    pub fn provenance_map(&self) -> HashMap<String, String> {
        self.provenance
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Coarse status mirrored into the search cache for external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Pending,
    InProgress,
    Done,
    NotFound,
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Pending => "PENDING",
            CacheStatus::InProgress => "IN_PROGRESS",
            CacheStatus::Done => "DONE",
            CacheStatus::NotFound => "NOT_FOUND",
            CacheStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CacheStatus::Done | CacheStatus::NotFound | CacheStatus::Error
        )
    }

    /// Fixed mapping from lineage status to the coarse cache status.
    pub fn from_lineage(status: LineageStatus) -> Self {
        match status {
            LineageStatus::Pending => CacheStatus::Pending,
            LineageStatus::Processing
            | LineageStatus::FactsFetched
            | LineageStatus::CreatorResolved
            | LineageStatus::ChildrenResolved => CacheStatus::InProgress,
            LineageStatus::Complete => CacheStatus::Done,
            LineageStatus::Invalid => CacheStatus::NotFound,
            LineageStatus::Failed => CacheStatus::Error,
        }
    }
}

impl FromStr for CacheStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CacheStatus::Pending),
            "IN_PROGRESS" => Ok(CacheStatus::InProgress),
            "DONE" => Ok(CacheStatus::Done),
            "NOT_FOUND" => Ok(CacheStatus::NotFound),
            "ERROR" => Ok(CacheStatus::Error),
            other => Err(format!("unknown cache status: {}", other)),
        }
    }
}

/// Externally-observed interest in an account (a user query). Created by the
/// search layer; the core only promotes it into the work queue and mirrors
/// terminal outcomes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCacheRecord {
    pub account_id: String,
    pub network_id: String,
    pub status: CacheStatus,
    pub cached_result: Option<String>,
    pub refreshed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Leaderboard standing-change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandingChangeType {
    Entered,
    Exited,
    RankUp,
    RankDown,
    BalanceIncrease,
    BalanceDecrease,
}

impl StandingChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StandingChangeType::Entered => "ENTERED",
            StandingChangeType::Exited => "EXITED",
            StandingChangeType::RankUp => "RANK_UP",
            StandingChangeType::RankDown => "RANK_DOWN",
            StandingChangeType::BalanceIncrease => "BALANCE_INCREASE",
            StandingChangeType::BalanceDecrease => "BALANCE_DECREASE",
        }
    }
}

impl FromStr for StandingChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTERED" => Ok(StandingChangeType::Entered),
            "EXITED" => Ok(StandingChangeType::Exited),
            "RANK_UP" => Ok(StandingChangeType::RankUp),
            "RANK_DOWN" => Ok(StandingChangeType::RankDown),
            "BALANCE_INCREASE" => Ok(StandingChangeType::BalanceIncrease),
            "BALANCE_DECREASE" => Ok(StandingChangeType::BalanceDecrease),
            other => Err(format!("unknown standing change type: {}", other)),
        }
    }
}

/// Append-only leaderboard event. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandingChangeEvent {
    pub account_id: String,
    pub network_id: String,
    pub event_type: StandingChangeType,
    pub old_rank: Option<i64>,
    pub new_rank: Option<i64>,
    pub old_balance: f64,
    pub new_balance: f64,
    pub threshold: f64,
    pub created_at: i64,
}

/// Outcome of one orchestrator batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// A record flagged by the stuck monitor.
#[derive(Debug, Clone)]
pub struct StuckInfo {
    pub account_id: String,
    pub network_id: String,
    pub status: LineageStatus,
    pub origin: RecordOrigin,
    pub retry_count: i64,
    /// Seconds since the record last advanced.
    pub stalled_for_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let all = [
            LineageStatus::Pending,
            LineageStatus::Processing,
            LineageStatus::FactsFetched,
            LineageStatus::CreatorResolved,
            LineageStatus::ChildrenResolved,
            LineageStatus::Complete,
            LineageStatus::Invalid,
            LineageStatus::Failed,
        ];
        for status in all {
            assert_eq!(status.as_str().parse::<LineageStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<LineageStatus>().is_err());
    }

    #[test]
    fn test_terminal_and_in_flight_partition() {
        assert!(LineageStatus::Complete.is_terminal());
        assert!(LineageStatus::Invalid.is_terminal());
        assert!(LineageStatus::Failed.is_terminal());
        assert!(!LineageStatus::Pending.is_terminal());

        assert!(LineageStatus::Processing.is_in_flight());
        assert!(LineageStatus::ChildrenResolved.is_in_flight());
        assert!(!LineageStatus::Pending.is_in_flight());
        assert!(!LineageStatus::Complete.is_in_flight());
    }

    #[test]
    fn test_transition_validity() {
        use LineageStatus::*;

        assert!(Pending.can_advance_to(Processing));
        assert!(Processing.can_advance_to(FactsFetched));
        assert!(FactsFetched.can_advance_to(CreatorResolved));
        assert!(CreatorResolved.can_advance_to(ChildrenResolved));

        // Terminal transitions allowed from any in-flight state.
        assert!(Processing.can_advance_to(Invalid));
        assert!(FactsFetched.can_advance_to(Failed));
        assert!(ChildrenResolved.can_advance_to(Complete));

        // No skipping phases, no leaving terminal states.
        assert!(!Processing.can_advance_to(CreatorResolved));
        assert!(!Pending.can_advance_to(Complete));
        assert!(!Complete.can_advance_to(Processing));
        assert!(!Failed.can_advance_to(Pending));
    }

    #[test]
    fn test_phase_ordering() {
        assert_eq!(
            ProcessingPhase::FetchFacts.next(),
            Some(ProcessingPhase::FindCreator)
        );
        assert_eq!(ProcessingPhase::FetchAssets.next(), None);
        assert_eq!(
            ProcessingPhase::FindChildren.completed_status(),
            Some(LineageStatus::ChildrenResolved)
        );
        assert_eq!(ProcessingPhase::FetchAssets.completed_status(), None);
    }

    #[test]
    fn test_resume_phase_from_last_completed() {
        let mut record = sample_record();
        assert_eq!(record.resume_phase(), ProcessingPhase::FetchFacts);

        record.last_completed_phase = Some(ProcessingPhase::FindCreator);
        assert_eq!(record.resume_phase(), ProcessingPhase::FindChildren);

        record.last_completed_phase = Some(ProcessingPhase::FetchAssets);
        assert_eq!(record.resume_phase(), ProcessingPhase::FetchAssets);
    }

    #[test]
    fn test_cache_status_mapping() {
        assert_eq!(
            CacheStatus::from_lineage(LineageStatus::Complete),
            CacheStatus::Done
        );
        assert_eq!(
            CacheStatus::from_lineage(LineageStatus::Invalid),
            CacheStatus::NotFound
        );
        assert_eq!(
            CacheStatus::from_lineage(LineageStatus::Failed),
            CacheStatus::Error
        );
        assert_eq!(
            CacheStatus::from_lineage(LineageStatus::FactsFetched),
            CacheStatus::InProgress
        );
        assert_eq!(
            CacheStatus::from_lineage(LineageStatus::Pending),
            CacheStatus::Pending
        );
    }

    #[test]
    fn test_populated_fields() {
        let mut facts = AccountFacts::from_source(DataSourceKind::Ledger);
        assert!(facts.populated_fields().is_empty());

        facts.balance = Some(10.0);
        facts.home_domain = Some("example.org".to_string());
        let fields = facts.populated_fields();
        assert!(fields.contains(&"balance"));
        assert!(fields.contains(&"home_domain"));
        assert!(!fields.contains(&"assets"));
    }

    fn sample_record() -> LineageRecord {
        LineageRecord {
            account_id: "GTEST".to_string(),
            network_id: "public".to_string(),
            status: LineageStatus::Pending,
            creator_account_id: None,
            creator_resolved: false,
            balance: None,
            home_domain: None,
            flags: None,
            attributes_blob: None,
            assets_blob: None,
            provenance: None,
            pipeline_source: None,
            retry_count: 0,
            last_error: None,
            processing_started_at: None,
            last_pipeline_attempt: None,
            last_completed_phase: None,
            account_created_at: None,
            origin: RecordOrigin::Search,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
        }
    }
}
