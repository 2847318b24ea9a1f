//! Queue synchronizer
//!
//! Two queues exist independently: the search layer writes interest into the
//! search cache, and the pipeline works off lineage records. This module
//! reconciles them in both directions: promoting cache entries into the
//! authoritative work queue (idempotently, through `enqueue`) and mirroring
//! terminal pipeline outcomes back onto the cache.

use crate::store::LineageStore;
use crate::types::{CacheStatus, LineageStatus, RecordOrigin};
use crate::BoxError;
use std::sync::Arc;

/// Outcome of one promotion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub promoted: usize,
    pub already_exists: usize,
    pub errors: usize,
}

pub struct QueueSynchronizer {
    store: Arc<dyn LineageStore>,
    cache_ttl_secs: i64,
}

impl QueueSynchronizer {
    pub fn new(store: Arc<dyn LineageStore>, cache_ttl_secs: i64) -> Self {
        Self {
            store,
            cache_ttl_secs,
        }
    }

    /// Promote up to `max_accounts` PENDING cache entries into the lineage
    /// queue. `enqueue` is insert-if-absent, so re-promotion never creates
    /// duplicates and never regresses an in-flight or completed record.
    pub async fn sync_pending_to_lineage(
        &self,
        network_id: &str,
        max_accounts: usize,
    ) -> Result<SyncOutcome, BoxError> {
        let entries = self
            .store
            .pending_cache_entries(network_id, max_accounts)
            .await?;

        let mut outcome = SyncOutcome::default();
        for entry in entries {
            match self
                .store
                .enqueue(&entry.account_id, network_id, RecordOrigin::Search)
                .await
            {
                Ok(true) => outcome.promoted += 1,
                Ok(false) => outcome.already_exists += 1,
                Err(e) => {
                    outcome.errors += 1;
                    log::error!(
                        "❌ Failed to promote {}/{} into lineage queue: {}",
                        entry.account_id,
                        network_id,
                        e
                    );
                }
            }
        }

        if outcome.promoted > 0 {
            log::info!(
                "🔁 Promoted {} search requests into the lineage queue ({} already tracked)",
                outcome.promoted,
                outcome.already_exists
            );
        }
        Ok(outcome)
    }

    /// Mirror a lineage status onto the matching cache entry. Absence of a
    /// cache entry is a no-op, not an error: discovery-originated records
    /// never had one.
    pub async fn sync_status_back_to_cache(
        &self,
        account_id: &str,
        network_id: &str,
        status: LineageStatus,
        result_summary: Option<&str>,
    ) -> Result<(), BoxError> {
        let mapped = CacheStatus::from_lineage(status);

        let existing = match self.store.get_cache_entry(account_id, network_id).await? {
            Some(entry) => entry,
            None => return Ok(()),
        };

        // A fresh terminal result must not be regressed to an in-progress
        // status by a late-arriving sync; users keep seeing the stable
        // answer until its TTL lapses.
        if !mapped.is_terminal() && existing.status.is_terminal() {
            let now = chrono::Utc::now().timestamp();
            let fresh = existing
                .refreshed_at
                .map(|at| now - at < self.cache_ttl_secs)
                .unwrap_or(false);
            if fresh {
                log::debug!(
                    "Cache entry {}/{} is fresh and terminal; skipping {} sync",
                    account_id,
                    network_id,
                    mapped.as_str()
                );
                return Ok(());
            }
        }

        self.store
            .update_cache_status(account_id, network_id, mapped, result_summary)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteLineageStore;
    use crate::types::AccountFacts;
    use tempfile::NamedTempFile;

    async fn setup() -> (NamedTempFile, Arc<SqliteLineageStore>, QueueSynchronizer) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteLineageStore::open(temp.path().to_str().unwrap()).unwrap());
        let sync = QueueSynchronizer::new(store.clone(), 300);
        (temp, store, sync)
    }

    #[tokio::test]
    async fn test_promotion_is_idempotent() {
        let (_temp, store, sync) = setup().await;

        for id in ["GA", "GB"] {
            store
                .upsert_cache_entry(id, "public", CacheStatus::Pending)
                .await
                .unwrap();
        }

        let first = sync.sync_pending_to_lineage("public", 10).await.unwrap();
        assert_eq!(first.promoted, 2);
        assert_eq!(first.already_exists, 0);
        assert_eq!(first.errors, 0);

        // Same input again: no duplicates, no status churn.
        let second = sync.sync_pending_to_lineage("public", 10).await.unwrap();
        assert_eq!(second.promoted, 0);
        assert_eq!(second.already_exists, 2);

        let due = store.due_pending("public", 10).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_promotion_never_regresses_lineage() {
        let (_temp, store, sync) = setup().await;

        // A record already claimed by a worker...
        store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();
        store.try_claim("GA", "public").await.unwrap().unwrap();

        // ...while the cache still shows the request as pending.
        store
            .upsert_cache_entry("GA", "public", CacheStatus::Pending)
            .await
            .unwrap();

        let outcome = sync.sync_pending_to_lineage("public", 10).await.unwrap();
        assert_eq!(outcome.promoted, 0);
        assert_eq!(outcome.already_exists, 1);

        let record = store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Processing);
    }

    #[tokio::test]
    async fn test_promotion_respects_max_accounts() {
        let (_temp, store, sync) = setup().await;
        for id in ["GA", "GB", "GC"] {
            store
                .upsert_cache_entry(id, "public", CacheStatus::Pending)
                .await
                .unwrap();
        }

        let outcome = sync.sync_pending_to_lineage("public", 2).await.unwrap();
        assert_eq!(outcome.promoted, 2);
    }

    #[tokio::test]
    async fn test_sync_back_maps_terminal_statuses() {
        let (_temp, store, sync) = setup().await;
        store
            .upsert_cache_entry("GA", "public", CacheStatus::Pending)
            .await
            .unwrap();

        sync.sync_status_back_to_cache(
            "GA",
            "public",
            LineageStatus::Complete,
            Some(r#"{"children":3}"#),
        )
        .await
        .unwrap();

        let entry = store.get_cache_entry("GA", "public").await.unwrap().unwrap();
        assert_eq!(entry.status, CacheStatus::Done);
        assert_eq!(entry.cached_result.as_deref(), Some(r#"{"children":3}"#));

        store
            .upsert_cache_entry("GB", "public", CacheStatus::Pending)
            .await
            .unwrap();
        sync.sync_status_back_to_cache("GB", "public", LineageStatus::Invalid, None)
            .await
            .unwrap();
        let entry = store.get_cache_entry("GB", "public").await.unwrap().unwrap();
        assert_eq!(entry.status, CacheStatus::NotFound);
    }

    #[tokio::test]
    async fn test_sync_back_without_cache_entry_is_noop() {
        let (_temp, store, sync) = setup().await;

        // Discovery-originated record: no cache entry exists.
        store
            .enqueue("GDISC", "public", RecordOrigin::Discovery)
            .await
            .unwrap();

        let result = sync
            .sync_status_back_to_cache("GDISC", "public", LineageStatus::Complete, None)
            .await;
        assert!(result.is_ok());
        assert!(store
            .get_cache_entry("GDISC", "public")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fresh_terminal_result_is_not_regressed() {
        let (_temp, store, sync) = setup().await;
        store
            .upsert_cache_entry("GA", "public", CacheStatus::Pending)
            .await
            .unwrap();

        sync.sync_status_back_to_cache("GA", "public", LineageStatus::Complete, Some("{}"))
            .await
            .unwrap();

        // A stale in-progress sync arriving after the terminal result.
        sync.sync_status_back_to_cache("GA", "public", LineageStatus::Processing, None)
            .await
            .unwrap();

        let entry = store.get_cache_entry("GA", "public").await.unwrap().unwrap();
        assert_eq!(entry.status, CacheStatus::Done);
    }

    #[tokio::test]
    async fn test_completed_record_facts_untouched_by_sync() {
        let (_temp, store, sync) = setup().await;

        store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();
        store.try_claim("GA", "public").await.unwrap().unwrap();
        let facts = AccountFacts {
            balance: Some(7.0),
            source: Some(crate::types::DataSourceKind::Ledger),
            ..Default::default()
        };
        store
            .advance_phase("GA", "public", LineageStatus::FactsFetched, &facts, None)
            .await
            .unwrap();

        store
            .upsert_cache_entry("GA", "public", CacheStatus::Pending)
            .await
            .unwrap();
        sync.sync_pending_to_lineage("public", 10).await.unwrap();

        let record = store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::FactsFetched);
        assert_eq!(record.balance, Some(7.0));
    }
}
