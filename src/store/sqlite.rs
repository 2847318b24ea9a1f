//! SQLite implementation of the lineage store
//!
//! One database file holds every table the pipeline shares across worker
//! processes. WAL mode is enabled so batch workers, the stuck monitor, and
//! the queue synchronizer can interleave reads and writes; the claim
//! operation is a single conditional UPDATE, so exclusivity never depends on
//! the in-process connection mutex.

use super::LineageStore;
use crate::config::{BatchOutcome, PipelineConfig};
use crate::types::{
    AccountFacts, CacheStatus, CreatorLookup, LineageRecord, LineageStatus, ProcessingPhase,
    RecordOrigin, SearchCacheRecord, StandingChangeEvent,
};
use crate::BoxError;
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lineage_records (
    account_id              TEXT NOT NULL,
    network_id              TEXT NOT NULL,
    status                  TEXT NOT NULL DEFAULT 'PENDING',
    creator_account_id      TEXT,
    creator_resolved        INTEGER NOT NULL DEFAULT 0,
    balance                 REAL,
    home_domain             TEXT,
    flags                   INTEGER,
    attributes_blob         TEXT,
    assets_blob             TEXT,
    provenance              TEXT,
    pipeline_source         TEXT,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    last_error              TEXT,
    processing_started_at   INTEGER,
    last_pipeline_attempt   INTEGER,
    last_completed_phase    TEXT,
    account_created_at      INTEGER,
    origin                  TEXT NOT NULL DEFAULT 'discovery',
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL,
    PRIMARY KEY (account_id, network_id)
);

CREATE INDEX IF NOT EXISTS idx_lineage_status
    ON lineage_records (network_id, status, created_at);

CREATE TABLE IF NOT EXISTS search_cache (
    account_id      TEXT NOT NULL,
    network_id      TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'PENDING',
    cached_result   TEXT,
    refreshed_at    INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    PRIMARY KEY (account_id, network_id)
);

CREATE TABLE IF NOT EXISTS standing_changes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      TEXT NOT NULL,
    network_id      TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    old_rank        INTEGER,
    new_rank        INTEGER,
    old_balance     REAL NOT NULL,
    new_balance     REAL NOT NULL,
    threshold       REAL NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_standing_account
    ON standing_changes (account_id, network_id, threshold, id);

CREATE TABLE IF NOT EXISTS pipeline_config (
    id                          INTEGER PRIMARY KEY CHECK (id = 1),
    pipeline_mode               TEXT NOT NULL,
    cost_limit_usd              REAL NOT NULL,
    size_limit_mb               REAL NOT NULL,
    instant_query_max_age_days  INTEGER NOT NULL,
    batch_size                  INTEGER NOT NULL,
    max_concurrent              INTEGER NOT NULL,
    ledger_page_limit           INTEGER NOT NULL,
    warehouse_row_limit         INTEGER NOT NULL,
    cache_ttl_secs              INTEGER NOT NULL,
    last_run_at                 INTEGER,
    last_run_status             TEXT,
    last_run_processed          INTEGER,
    last_run_failed             INTEGER,
    last_run_skipped            INTEGER
);

CREATE TABLE IF NOT EXISTS rate_limiter_state (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    expires_at  INTEGER NOT NULL
);
"#;

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn parse_text<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LineageRecord> {
    let status: String = row.get(2)?;
    let phase: Option<String> = row.get(16)?;
    let origin: String = row.get(18)?;
    Ok(LineageRecord {
        account_id: row.get(0)?,
        network_id: row.get(1)?,
        status: parse_text(2, status)?,
        creator_account_id: row.get(3)?,
        creator_resolved: row.get::<_, i64>(4)? != 0,
        balance: row.get(5)?,
        home_domain: row.get(6)?,
        flags: row.get(7)?,
        attributes_blob: row.get(8)?,
        assets_blob: row.get(9)?,
        provenance: row.get(10)?,
        pipeline_source: row.get(11)?,
        retry_count: row.get(12)?,
        last_error: row.get(13)?,
        processing_started_at: row.get(14)?,
        last_pipeline_attempt: row.get(15)?,
        last_completed_phase: match phase {
            Some(raw) => Some(parse_text(16, raw)?),
            None => None,
        },
        account_created_at: row.get(17)?,
        origin: parse_text(18, origin)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

const RECORD_COLUMNS: &str = "account_id, network_id, status, creator_account_id, \
     creator_resolved, balance, home_domain, flags, attributes_blob, assets_blob, \
     provenance, pipeline_source, retry_count, last_error, processing_started_at, \
     last_pipeline_attempt, last_completed_phase, account_created_at, origin, \
     created_at, updated_at";

fn cache_from_row(row: &Row<'_>) -> rusqlite::Result<SearchCacheRecord> {
    let status: String = row.get(2)?;
    Ok(SearchCacheRecord {
        account_id: row.get(0)?,
        network_id: row.get(1)?,
        status: parse_text(2, status)?,
        cached_result: row.get(3)?,
        refreshed_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<StandingChangeEvent> {
    let event_type: String = row.get(2)?;
    Ok(StandingChangeEvent {
        account_id: row.get(0)?,
        network_id: row.get(1)?,
        event_type: parse_text(2, event_type)?,
        old_rank: row.get(3)?,
        new_rank: row.get(4)?,
        old_balance: row.get(5)?,
        new_balance: row.get(6)?,
        threshold: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// SQLite-backed lineage store.
pub struct SqliteLineageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLineageStore {
    /// Open (or create) the database, enable WAL, and run the idempotent
    /// schema migration.
    pub fn open(db_path: &str) -> Result<Self, BoxError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(SCHEMA)?;
        log::info!("📊 Lineage store ready at {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement; the
        // connection itself is still usable for independent statements.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get_sync(
        conn: &Connection,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<LineageRecord>, BoxError> {
        let sql = format!(
            "SELECT {} FROM lineage_records WHERE account_id = ?1 AND network_id = ?2",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![account_id, network_id], record_from_row)?;
        match rows.next() {
            Some(record) => Ok(Some(record?)),
            None => Ok(None),
        }
    }

    /// Merge partial facts over the stored record and persist the resulting
    /// state under a compare-and-set on the observed current status. The
    /// caller owns the claim, so read-merge-write is race-free; the CAS is
    /// the backstop against a stuck reset sliding in between.
    ///
    /// A freshly claimed record sits in PROCESSING regardless of how far a
    /// previous (crashed and reset) run got; `last_completed_phase` decides
    /// which phase transition is legal from there, so resumed runs re-enter
    /// the sequence at the right point instead of replaying earlier phases.
    #[allow(clippy::too_many_arguments)]
    fn merge_and_transition(
        &self,
        account_id: &str,
        network_id: &str,
        new_status: LineageStatus,
        facts: &AccountFacts,
        creator: Option<&CreatorLookup>,
        phase_done: Option<ProcessingPhase>,
        pipeline_source: Option<&str>,
    ) -> Result<(), BoxError> {
        let conn = self.lock();
        let record = Self::get_sync(&conn, account_id, network_id)?
            .ok_or_else(|| format!("no lineage record for {}/{}", account_id, network_id))?;

        // The natural path requires the direct predecessor status; the
        // resumed path accepts PROCESSING when the persisted phase cursor
        // points at exactly this phase.
        let resumed = record.status == LineageStatus::Processing
            && phase_done.map(|p| record.resume_phase() == p).unwrap_or(false);
        let valid = resumed
            || match new_status {
                LineageStatus::CreatorResolved => record.status == LineageStatus::FactsFetched,
                LineageStatus::ChildrenResolved => record.status == LineageStatus::CreatorResolved,
                LineageStatus::Complete => record.status == LineageStatus::ChildrenResolved,
                _ => false,
            };
        if !valid {
            return Err(format!(
                "invalid transition {} -> {} for {}/{} (last phase {:?})",
                record.status.as_str(),
                new_status.as_str(),
                account_id,
                network_id,
                record.last_completed_phase.map(|p| p.as_str())
            )
            .into());
        }

        let mut provenance = record.provenance_map();
        if let Some(kind) = facts.source {
            for field in facts.populated_fields() {
                provenance.insert(field.to_string(), kind.as_str().to_string());
            }
        }

        let balance = facts.balance.or(record.balance);
        let home_domain = facts.home_domain.clone().or(record.home_domain);
        let flags = facts.flags.or(record.flags);
        let attributes_blob = match &facts.attributes {
            Some(value) => Some(serde_json::to_string(value)?),
            None => record.attributes_blob,
        };
        let assets_blob = match &facts.assets {
            Some(value) => Some(serde_json::to_string(value)?),
            None => record.assets_blob,
        };
        let mut account_created_at = facts.account_created_at.or(record.account_created_at);

        let (creator_account_id, creator_resolved) = match creator {
            Some(CreatorLookup::Found {
                creator_account_id,
                account_created_at: op_time,
            }) => {
                if account_created_at.is_none() {
                    account_created_at = *op_time;
                }
                (Some(creator_account_id.clone()), true)
            }
            Some(CreatorLookup::Root) => (None, true),
            Some(CreatorLookup::Unknown) | None => {
                (record.creator_account_id, record.creator_resolved)
            }
        };

        let now = now_ts();
        let phase_str = phase_done
            .map(|p| p.as_str().to_string())
            .or_else(|| record.last_completed_phase.map(|p| p.as_str().to_string()));
        let terminal = new_status.is_terminal();

        let changed = conn.execute(
            "UPDATE lineage_records SET
                status = ?3,
                creator_account_id = ?4,
                creator_resolved = ?5,
                balance = ?6,
                home_domain = ?7,
                flags = ?8,
                attributes_blob = ?9,
                assets_blob = ?10,
                provenance = ?11,
                pipeline_source = COALESCE(?12, pipeline_source),
                last_completed_phase = ?13,
                account_created_at = ?14,
                last_error = CASE WHEN ?15 THEN NULL ELSE last_error END,
                processing_started_at = CASE WHEN ?15 THEN NULL ELSE processing_started_at END,
                updated_at = ?16
             WHERE account_id = ?1 AND network_id = ?2 AND status = ?17",
            params![
                account_id,
                network_id,
                new_status.as_str(),
                creator_account_id,
                creator_resolved as i64,
                balance,
                home_domain,
                flags,
                attributes_blob,
                assets_blob,
                serde_json::to_string(&provenance)?,
                pipeline_source,
                phase_str,
                account_created_at,
                terminal,
                now,
                record.status.as_str(),
            ],
        )?;

        if changed == 0 {
            return Err(format!(
                "lost transition race for {}/{} ({} -> {})",
                account_id,
                network_id,
                record.status.as_str(),
                new_status.as_str()
            )
            .into());
        }
        Ok(())
    }

    fn terminal_transition(
        &self,
        account_id: &str,
        network_id: &str,
        new_status: LineageStatus,
        error: Option<&str>,
    ) -> Result<(), BoxError> {
        let conn = self.lock();
        let in_flight = [
            LineageStatus::Processing.as_str(),
            LineageStatus::FactsFetched.as_str(),
            LineageStatus::CreatorResolved.as_str(),
            LineageStatus::ChildrenResolved.as_str(),
        ];
        let sql = format!(
            "UPDATE lineage_records SET
                status = ?3,
                last_error = ?4,
                processing_started_at = NULL,
                updated_at = ?5
             WHERE account_id = ?1 AND network_id = ?2 AND status IN ('{}')",
            in_flight.join("','")
        );
        let changed = conn.execute(
            &sql,
            params![account_id, network_id, new_status.as_str(), error, now_ts()],
        )?;
        if changed == 0 {
            return Err(format!(
                "no in-flight record to transition to {} for {}/{}",
                new_status.as_str(),
                account_id,
                network_id
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl LineageStore for SqliteLineageStore {
    async fn enqueue(
        &self,
        account_id: &str,
        network_id: &str,
        origin: RecordOrigin,
    ) -> Result<bool, BoxError> {
        let conn = self.lock();
        let now = now_ts();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO lineage_records
                (account_id, network_id, status, origin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                account_id,
                network_id,
                LineageStatus::Pending.as_str(),
                origin.as_str(),
                now
            ],
        )?;
        Ok(changed > 0)
    }

    async fn get(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<LineageRecord>, BoxError> {
        let conn = self.lock();
        Self::get_sync(&conn, account_id, network_id)
    }

    async fn due_pending(
        &self,
        network_id: &str,
        limit: usize,
    ) -> Result<Vec<LineageRecord>, BoxError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM lineage_records
             WHERE network_id = ?1 AND status = ?2
             ORDER BY created_at ASC, account_id ASC
             LIMIT ?3",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![network_id, LineageStatus::Pending.as_str(), limit as i64],
            record_from_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn try_claim(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<LineageRecord>, BoxError> {
        let conn = self.lock();
        let now = now_ts();
        // Compare-and-set on status: exactly one concurrent caller can move
        // PENDING -> PROCESSING, regardless of how many processes race.
        let changed = conn.execute(
            "UPDATE lineage_records SET
                status = ?3,
                processing_started_at = ?4,
                last_pipeline_attempt = ?4,
                updated_at = ?4
             WHERE account_id = ?1 AND network_id = ?2 AND status = ?5",
            params![
                account_id,
                network_id,
                LineageStatus::Processing.as_str(),
                now,
                LineageStatus::Pending.as_str(),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Self::get_sync(&conn, account_id, network_id)
    }

    async fn advance_phase(
        &self,
        account_id: &str,
        network_id: &str,
        new_status: LineageStatus,
        facts: &AccountFacts,
        creator: Option<&CreatorLookup>,
    ) -> Result<(), BoxError> {
        let phase_done = match new_status {
            LineageStatus::FactsFetched => ProcessingPhase::FetchFacts,
            LineageStatus::CreatorResolved => ProcessingPhase::FindCreator,
            LineageStatus::ChildrenResolved => ProcessingPhase::FindChildren,
            other => {
                return Err(format!(
                    "advance_phase cannot target {} (use complete/fail/mark_invalid)",
                    other.as_str()
                )
                .into())
            }
        };
        self.merge_and_transition(
            account_id,
            network_id,
            new_status,
            facts,
            creator,
            Some(phase_done),
            None,
        )
    }

    async fn complete(
        &self,
        account_id: &str,
        network_id: &str,
        facts: &AccountFacts,
        pipeline_source: &str,
    ) -> Result<(), BoxError> {
        self.merge_and_transition(
            account_id,
            network_id,
            LineageStatus::Complete,
            facts,
            None,
            Some(ProcessingPhase::FetchAssets),
            Some(pipeline_source),
        )
    }

    async fn fail(&self, account_id: &str, network_id: &str, error: &str) -> Result<(), BoxError> {
        self.terminal_transition(account_id, network_id, LineageStatus::Failed, Some(error))
    }

    async fn mark_invalid(
        &self,
        account_id: &str,
        network_id: &str,
        reason: &str,
    ) -> Result<(), BoxError> {
        self.terminal_transition(account_id, network_id, LineageStatus::Invalid, Some(reason))
    }

    async fn return_to_pending(
        &self,
        account_id: &str,
        network_id: &str,
        error: &str,
    ) -> Result<(), BoxError> {
        let conn = self.lock();
        let in_flight = [
            LineageStatus::Processing.as_str(),
            LineageStatus::FactsFetched.as_str(),
            LineageStatus::CreatorResolved.as_str(),
            LineageStatus::ChildrenResolved.as_str(),
        ];
        let sql = format!(
            "UPDATE lineage_records SET
                status = ?3,
                retry_count = retry_count + 1,
                last_error = ?4,
                processing_started_at = NULL,
                updated_at = ?5
             WHERE account_id = ?1 AND network_id = ?2 AND status IN ('{}')",
            in_flight.join("','")
        );
        // Zero rows is fine: a concurrent terminal transition won the race
        // and the record must not regress.
        conn.execute(
            &sql,
            params![
                account_id,
                network_id,
                LineageStatus::Pending.as_str(),
                error,
                now_ts()
            ],
        )?;
        Ok(())
    }

    async fn inflight_records(&self, network_id: &str) -> Result<Vec<LineageRecord>, BoxError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM lineage_records
             WHERE network_id = ?1 AND status IN (?2, ?3, ?4, ?5)
             ORDER BY updated_at ASC",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                network_id,
                LineageStatus::Processing.as_str(),
                LineageStatus::FactsFetched.as_str(),
                LineageStatus::CreatorResolved.as_str(),
                LineageStatus::ChildrenResolved.as_str(),
            ],
            record_from_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn upsert_cache_entry(
        &self,
        account_id: &str,
        network_id: &str,
        status: CacheStatus,
    ) -> Result<(), BoxError> {
        let conn = self.lock();
        let now = now_ts();
        conn.execute(
            "INSERT INTO search_cache (account_id, network_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(account_id, network_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![account_id, network_id, status.as_str(), now],
        )?;
        Ok(())
    }

    async fn get_cache_entry(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<SearchCacheRecord>, BoxError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, network_id, status, cached_result, refreshed_at,
                    created_at, updated_at
             FROM search_cache WHERE account_id = ?1 AND network_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![account_id, network_id], cache_from_row)?;
        match rows.next() {
            Some(record) => Ok(Some(record?)),
            None => Ok(None),
        }
    }

    async fn pending_cache_entries(
        &self,
        network_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchCacheRecord>, BoxError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, network_id, status, cached_result, refreshed_at,
                    created_at, updated_at
             FROM search_cache
             WHERE network_id = ?1 AND status = ?2
             ORDER BY created_at ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![network_id, CacheStatus::Pending.as_str(), limit as i64],
            cache_from_row,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn update_cache_status(
        &self,
        account_id: &str,
        network_id: &str,
        status: CacheStatus,
        result_summary: Option<&str>,
    ) -> Result<bool, BoxError> {
        let conn = self.lock();
        let now = now_ts();
        let changed = conn.execute(
            "UPDATE search_cache SET
                status = ?3,
                cached_result = COALESCE(?4, cached_result),
                refreshed_at = ?5,
                updated_at = ?5
             WHERE account_id = ?1 AND network_id = ?2",
            params![account_id, network_id, status.as_str(), result_summary, now],
        )?;
        Ok(changed > 0)
    }

    async fn records_with_balance_at_least(
        &self,
        network_id: &str,
        threshold: f64,
    ) -> Result<Vec<LineageRecord>, BoxError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM lineage_records
             WHERE network_id = ?1 AND balance IS NOT NULL AND balance >= ?2",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![network_id, threshold], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn append_standing_change(&self, event: &StandingChangeEvent) -> Result<(), BoxError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO standing_changes
                (account_id, network_id, event_type, old_rank, new_rank,
                 old_balance, new_balance, threshold, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.account_id,
                event.network_id,
                event.event_type.as_str(),
                event.old_rank,
                event.new_rank,
                event.old_balance,
                event.new_balance,
                event.threshold,
                event.created_at,
            ],
        )?;
        Ok(())
    }

    async fn latest_standing_change(
        &self,
        account_id: &str,
        network_id: &str,
        threshold: f64,
    ) -> Result<Option<StandingChangeEvent>, BoxError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, network_id, event_type, old_rank, new_rank,
                    old_balance, new_balance, threshold, created_at
             FROM standing_changes
             WHERE account_id = ?1 AND network_id = ?2 AND threshold = ?3
             ORDER BY id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![account_id, network_id, threshold], event_from_row)?;
        match rows.next() {
            Some(event) => Ok(Some(event?)),
            None => Ok(None),
        }
    }

    async fn ensure_config_row(&self, defaults: &PipelineConfig) -> Result<(), BoxError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO pipeline_config
                (id, pipeline_mode, cost_limit_usd, size_limit_mb,
                 instant_query_max_age_days, batch_size, max_concurrent,
                 ledger_page_limit, warehouse_row_limit, cache_ttl_secs)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                defaults.pipeline_mode.as_str(),
                defaults.cost_limit_usd,
                defaults.size_limit_mb,
                defaults.instant_query_max_age_days,
                defaults.batch_size as i64,
                defaults.max_concurrent as i64,
                defaults.ledger_page_limit,
                defaults.warehouse_row_limit,
                defaults.cache_ttl_secs,
            ],
        )?;
        Ok(())
    }

    async fn load_config(&self, base: &PipelineConfig) -> Result<PipelineConfig, BoxError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pipeline_mode, cost_limit_usd, size_limit_mb,
                    instant_query_max_age_days, batch_size, max_concurrent,
                    ledger_page_limit, warehouse_row_limit, cache_ttl_secs
             FROM pipeline_config WHERE id = 1",
        )?;
        let mut config = base.clone();
        let row = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?
        .next();
        if let Some(row) = row {
            let (mode, cost, size, age, batch, concurrent, page, rows_cap, ttl) = row?;
            config.pipeline_mode = mode.parse().map_err(|e: String| -> BoxError { e.into() })?;
            config.cost_limit_usd = cost;
            config.size_limit_mb = size;
            config.instant_query_max_age_days = age;
            config.batch_size = batch as usize;
            config.max_concurrent = concurrent as usize;
            config.ledger_page_limit = page;
            config.warehouse_row_limit = rows_cap;
            config.cache_ttl_secs = ttl;
        }
        Ok(config)
    }

    async fn record_batch_outcome(&self, outcome: &BatchOutcome) -> Result<(), BoxError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pipeline_config SET
                last_run_at = ?1,
                last_run_status = ?2,
                last_run_processed = ?3,
                last_run_failed = ?4,
                last_run_skipped = ?5
             WHERE id = 1",
            params![
                outcome.run_at,
                outcome.status,
                outcome.processed,
                outcome.failed,
                outcome.skipped,
            ],
        )?;
        Ok(())
    }
}

/// Expose the raw connection for tests that need to backdate timestamps.
#[cfg(test)]
impl SqliteLineageStore {
    pub(crate) fn raw(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.lock()
    }
}
