//! Pipeline orchestrator
//!
//! Drives claimed accounts through the phase sequence (facts -> creator ->
//! children -> assets) against an ordered chain of data sources chosen by the
//! configured strategy. Every external call goes through the shared rate
//! limiter and a per-call retry with backoff; failures are classified once,
//! at the adapter boundary, and mapped onto the state machine here.
//!
//! Multiple orchestrator processes may run batches concurrently; correctness
//! rests entirely on `try_claim`'s atomicity, so nothing here assumes it is
//! the only invocation.

use crate::backoff::ExponentialBackoff;
use crate::config::{BatchOutcome, PipelineConfig, PipelineMode};
use crate::queue_sync::QueueSynchronizer;
use crate::ranking::RankingEngine;
use crate::ratelimit::RateLimiter;
use crate::sources::{DataSource, SourceError};
use crate::store::LineageStore;
use crate::types::{
    AccountFacts, BatchResult, CreatorLookup, DataSourceKind, LineageRecord, LineageStatus,
    ProcessingPhase, RecordOrigin,
};
use crate::BoxError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// What happened to one claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    /// Reached an authoritative terminal state (COMPLETE or INVALID).
    Processed,
    /// FAILED, or returned to PENDING for another attempt.
    Failed,
    /// Claim lost to another worker.
    Skipped,
}

/// One adapter capability, dispatched through the retry/rate-limit wrapper.
#[derive(Debug, Clone, Copy)]
enum SourceOp {
    Facts,
    Creator,
    Children,
    Assets,
}

enum SourceOk {
    Facts(AccountFacts),
    Creator(CreatorLookup),
    Children(Vec<String>),
    Assets(serde_json::Value),
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    store: Arc<dyn LineageStore>,
    queue_sync: Arc<QueueSynchronizer>,
    limiter: Arc<RateLimiter>,
    ranking: Arc<RankingEngine>,
    warehouse: Option<Arc<dyn DataSource>>,
    ledger: Arc<dyn DataSource>,
    index: Arc<dyn DataSource>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn LineageStore>,
        queue_sync: Arc<QueueSynchronizer>,
        limiter: Arc<RateLimiter>,
        ranking: Arc<RankingEngine>,
        warehouse: Option<Arc<dyn DataSource>>,
        ledger: Arc<dyn DataSource>,
        index: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            store,
            queue_sync,
            limiter,
            ranking,
            warehouse,
            ledger,
            index,
        }
    }

    /// Run one batch: promote externally-created requests, pull due records
    /// oldest-first, and process them on a bounded worker pool under the
    /// batch soft deadline. Work that misses the deadline is abandoned to
    /// the stuck monitor, never rolled back.
    pub async fn run_batch(&self, config: &PipelineConfig) -> Result<BatchResult, BoxError> {
        let batch_start = std::time::Instant::now();

        if let Err(e) = self
            .queue_sync
            .sync_pending_to_lineage(&config.network_id, config.sync_max_accounts)
            .await
        {
            // Promotion failure starves the queue but must not kill the
            // batch; already-enqueued records still deserve processing.
            log::error!("❌ Queue sync failed before batch: {}", e);
        }

        let due = self
            .store
            .due_pending(&config.network_id, config.batch_size)
            .await?;
        let total = due.len();
        if total == 0 {
            log::debug!("No due records on {}", config.network_id);
            let result = BatchResult::default();
            self.write_monitoring(&result).await;
            return Ok(result);
        }

        log::info!(
            "🚀 Batch of {} records on {} (mode: {}, pool: {})",
            total,
            config.network_id,
            config.pipeline_mode.as_str(),
            config.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(config.batch_deadline_secs);

        let mut handles = Vec::new();
        for record in due {
            let permit = match tokio::time::timeout_at(
                deadline,
                semaphore.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                _ => break,
            };
            let this = self.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.process_record(&record, &config).await
            }));
        }

        let mut result = BatchResult::default();
        // Records never spawned (deadline hit while waiting for a permit)
        // were never claimed; they stay PENDING for the next batch.
        result.skipped += total - handles.len();

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(RecordOutcome::Processed))) => result.processed += 1,
                Ok(Ok(Ok(RecordOutcome::Failed))) => result.failed += 1,
                Ok(Ok(Ok(RecordOutcome::Skipped))) => result.skipped += 1,
                Ok(Ok(Err(e))) => {
                    // Storage I/O failure: fatal for this record only.
                    log::error!("❌ Record processing aborted on storage error: {}", e);
                    result.failed += 1;
                }
                Ok(Err(join_err)) => {
                    log::error!("❌ Worker task panicked: {}", join_err);
                    result.failed += 1;
                }
                Err(_elapsed) => {
                    handle.abort();
                    result.skipped += 1;
                    log::warn!(
                        "⌛ Batch deadline hit; abandoning in-flight record to the stuck monitor"
                    );
                }
            }
        }

        log::info!(
            "✅ Batch done in {:.1}s: {} processed, {} failed, {} skipped",
            batch_start.elapsed().as_secs_f64(),
            result.processed,
            result.failed,
            result.skipped
        );
        self.write_monitoring(&result).await;
        Ok(result)
    }

    async fn write_monitoring(&self, result: &BatchResult) {
        let outcome = BatchOutcome {
            run_at: chrono::Utc::now().timestamp(),
            status: if result.failed == 0 { "ok" } else { "partial" }.to_string(),
            processed: result.processed as i64,
            failed: result.failed as i64,
            skipped: result.skipped as i64,
        };
        if let Err(e) = self.store.record_batch_outcome(&outcome).await {
            log::warn!("⚠️  Could not write batch monitoring fields: {}", e);
        }
    }

    /// Source order for the configured strategy.
    fn build_plan(&self, mode: PipelineMode) -> Vec<Arc<dyn DataSource>> {
        let mut plan: Vec<Arc<dyn DataSource>> = Vec::new();
        match mode {
            PipelineMode::SourceWithFallback => {
                if let Some(warehouse) = &self.warehouse {
                    plan.push(warehouse.clone());
                }
                plan.push(self.ledger.clone());
                plan.push(self.index.clone());
            }
            PipelineMode::SourceOnly => {
                if let Some(warehouse) = &self.warehouse {
                    plan.push(warehouse.clone());
                }
            }
            PipelineMode::ApiOnly => {
                plan.push(self.ledger.clone());
                plan.push(self.index.clone());
            }
        }
        plan
    }

    fn api_plan(&self) -> Vec<Arc<dyn DataSource>> {
        vec![self.ledger.clone(), self.index.clone()]
    }

    async fn process_record(
        &self,
        record: &LineageRecord,
        config: &PipelineConfig,
    ) -> Result<RecordOutcome, BoxError> {
        let claimed = match self
            .store
            .try_claim(&record.account_id, &record.network_id)
            .await?
        {
            Some(claimed) => claimed,
            None => {
                log::debug!(
                    "Claim lost for {}/{}, another worker holds it",
                    record.account_id,
                    record.network_id
                );
                return Ok(RecordOutcome::Skipped);
            }
        };

        let mut plan = self.build_plan(config.pipeline_mode);
        if plan.is_empty() {
            self.store
                .fail(
                    &claimed.account_id,
                    &claimed.network_id,
                    "no data sources configured for pipeline mode",
                )
                .await?;
            self.sync_back(&claimed, LineageStatus::Failed, None).await;
            return Ok(RecordOutcome::Failed);
        }

        // Age-based routing: accounts with deep history skip the expensive
        // warehouse historical scan entirely.
        if plan[0].kind() == DataSourceKind::Warehouse {
            if let Some(created) = claimed.account_created_at {
                let age_days = (chrono::Utc::now().timestamp() - created) / 86_400;
                if age_days > config.instant_query_max_age_days {
                    log::info!(
                        "🕰️  {} is {} days old, routing to API adapters",
                        claimed.account_id,
                        age_days
                    );
                    plan.retain(|s| s.kind() != DataSourceKind::Warehouse);
                    if plan.is_empty() {
                        plan = self.api_plan();
                    }
                }
            }
        }

        // Cost guard: dry-run the warehouse before letting it run for real.
        if plan[0].kind() == DataSourceKind::Warehouse {
            let warehouse = plan[0].clone();
            match self
                .estimate_with_retry(&warehouse, &claimed, config)
                .await
            {
                Ok(Some(estimate)) => {
                    let blocked = estimate.estimated_usd > config.cost_limit_usd
                        || estimate.megabytes() > config.size_limit_mb;
                    if blocked {
                        log::info!(
                            "💸 Warehouse scan for {} estimated at ${:.2} / {:.0} MB \
                             (limits ${:.2} / {:.0} MB)",
                            claimed.account_id,
                            estimate.estimated_usd,
                            estimate.megabytes(),
                            config.cost_limit_usd,
                            config.size_limit_mb
                        );
                        if plan.len() > 1 {
                            log::info!(
                                "   └─ Falling back to API adapters for {}",
                                claimed.account_id
                            );
                            plan.retain(|s| s.kind() != DataSourceKind::Warehouse);
                        } else {
                            return self
                                .handle_source_error(
                                    &claimed,
                                    config,
                                    SourceError::CostBlocked {
                                        estimated_usd: estimate.estimated_usd,
                                        estimated_mb: estimate.megabytes(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if plan.len() > 1 {
                        log::warn!(
                            "⚠️  Cost estimate failed for {} ({}), using API adapters",
                            claimed.account_id,
                            e
                        );
                        plan.retain(|s| s.kind() != DataSourceKind::Warehouse);
                    } else {
                        return self.handle_source_error(&claimed, config, e).await;
                    }
                }
            }
        }

        self.run_phases(&claimed, config, &plan).await
    }

    /// The strictly-ordered phase sequence, entered at the claimed record's
    /// persisted phase cursor so resets resume instead of replaying.
    async fn run_phases(
        &self,
        claimed: &LineageRecord,
        config: &PipelineConfig,
        plan: &[Arc<dyn DataSource>],
    ) -> Result<RecordOutcome, BoxError> {
        let account_id = claimed.account_id.as_str();
        let network_id = claimed.network_id.as_str();
        let old_balance = claimed.balance.unwrap_or(0.0);
        let mut used_warehouse = false;
        let mut children_found = 0usize;

        let mut phase = Some(claimed.resume_phase());
        while let Some(current) = phase {
            let step = match current {
                ProcessingPhase::FetchFacts => {
                    match self.over_chain(plan, SourceOp::Facts, account_id, network_id, config).await {
                        Ok((SourceOk::Facts(facts), kind)) => {
                            used_warehouse |= kind == DataSourceKind::Warehouse;
                            self.store
                                .advance_phase(
                                    account_id,
                                    network_id,
                                    LineageStatus::FactsFetched,
                                    &facts,
                                    None,
                                )
                                .await?;
                            Ok(())
                        }
                        Ok(_) => unreachable!("facts op returns facts"),
                        Err(e) => Err(e),
                    }
                }
                ProcessingPhase::FindCreator => {
                    match self.over_chain(plan, SourceOp::Creator, account_id, network_id, config).await {
                        Ok((SourceOk::Creator(lookup), kind)) => {
                            used_warehouse |= kind == DataSourceKind::Warehouse;
                            if let CreatorLookup::Found {
                                creator_account_id, ..
                            } = &lookup
                            {
                                // Enqueue before persisting the phase: a
                                // failure here re-runs the phase and the
                                // insert is idempotent, so the discovered
                                // creator can never be silently dropped.
                                self.store
                                    .enqueue(creator_account_id, network_id, RecordOrigin::Discovery)
                                    .await?;
                            }
                            self.store
                                .advance_phase(
                                    account_id,
                                    network_id,
                                    LineageStatus::CreatorResolved,
                                    &AccountFacts::default(),
                                    Some(&lookup),
                                )
                                .await?;
                            Ok(())
                        }
                        Ok(_) => unreachable!("creator op returns creator"),
                        Err(e) => Err(e),
                    }
                }
                ProcessingPhase::FindChildren => {
                    match self.over_chain(plan, SourceOp::Children, account_id, network_id, config).await {
                        Ok((SourceOk::Children(children), kind)) => {
                            used_warehouse |= kind == DataSourceKind::Warehouse;
                            for child in &children {
                                if child != account_id
                                    && self
                                        .store
                                        .enqueue(child, network_id, RecordOrigin::Discovery)
                                        .await?
                                {
                                    children_found += 1;
                                }
                            }
                            self.store
                                .advance_phase(
                                    account_id,
                                    network_id,
                                    LineageStatus::ChildrenResolved,
                                    &AccountFacts::default(),
                                    None,
                                )
                                .await?;
                            Ok(())
                        }
                        Ok(_) => unreachable!("children op returns children"),
                        Err(e) => Err(e),
                    }
                }
                ProcessingPhase::FetchAssets => {
                    match self.over_chain(plan, SourceOp::Assets, account_id, network_id, config).await {
                        Ok((SourceOk::Assets(assets), kind)) => {
                            used_warehouse |= kind == DataSourceKind::Warehouse;
                            let mut facts = AccountFacts::from_source(kind);
                            facts.assets = Some(assets);
                            let family = if used_warehouse { "warehouse" } else { "api" };
                            self.store
                                .complete(account_id, network_id, &facts, family)
                                .await?;
                            Ok(())
                        }
                        Ok(_) => unreachable!("assets op returns assets"),
                        Err(e) => Err(e),
                    }
                }
            };

            if let Err(e) = step {
                return self.handle_source_error(claimed, config, e).await;
            }
            phase = current.next();
        }

        let final_record = self.store.get(account_id, network_id).await?;
        let summary = final_record.as_ref().map(|r| {
            serde_json::json!({
                "balance": r.balance,
                "creator": r.creator_account_id,
                "children_discovered": children_found,
            })
            .to_string()
        });
        if let Some(record) = &final_record {
            self.sync_back(record, LineageStatus::Complete, summary.as_deref())
                .await;

            // Balance updates feed the leaderboards; best-effort.
            if let Some(new_balance) = record.balance {
                if (new_balance - old_balance).abs() > f64::EPSILON {
                    for threshold in &config.ranking_thresholds {
                        if let Err(e) = self
                            .ranking
                            .detect_and_record_change(record, old_balance, new_balance, *threshold)
                            .await
                        {
                            log::warn!(
                                "⚠️  Standing-change detection failed for {}: {}",
                                record.account_id,
                                e
                            );
                        }
                    }
                }
            }
        }

        log::info!(
            "✅ Completed {}/{} ({} children discovered)",
            account_id,
            network_id,
            children_found
        );
        Ok(RecordOutcome::Processed)
    }

    /// Map a classified adapter failure onto the state machine.
    async fn handle_source_error(
        &self,
        claimed: &LineageRecord,
        config: &PipelineConfig,
        error: SourceError,
    ) -> Result<RecordOutcome, BoxError> {
        let account_id = &claimed.account_id;
        let network_id = &claimed.network_id;

        match &error {
            SourceError::NotFound(_) => {
                log::info!("🚫 {}/{} does not exist upstream", account_id, network_id);
                self.store
                    .mark_invalid(account_id, network_id, &error.to_string())
                    .await?;
                self.sync_back(claimed, LineageStatus::Invalid, None).await;
                Ok(RecordOutcome::Processed)
            }
            SourceError::CostBlocked { .. } => {
                self.store
                    .fail(
                        account_id,
                        network_id,
                        &format!("cost exceeded: {}", error),
                    )
                    .await?;
                self.sync_back(claimed, LineageStatus::Failed, None).await;
                Ok(RecordOutcome::Failed)
            }
            SourceError::Transient(_) | SourceError::RateLimited(_) => {
                if claimed.retry_count >= config.max_retry_attempts {
                    let message = format!(
                        "retry budget exhausted after {} attempts: {}",
                        claimed.retry_count, error
                    );
                    self.store.fail(account_id, network_id, &message).await?;
                    self.sync_back(claimed, LineageStatus::Failed, None).await;
                    log::warn!("❌ {}/{} failed: {}", account_id, network_id, message);
                } else {
                    self.store
                        .return_to_pending(account_id, network_id, &error.to_string())
                        .await?;
                    log::info!(
                        "🔁 {}/{} returned to queue after transient failure (retry {})",
                        account_id,
                        network_id,
                        claimed.retry_count + 1
                    );
                }
                Ok(RecordOutcome::Failed)
            }
            SourceError::Permanent(_) => {
                self.store
                    .fail(account_id, network_id, &error.to_string())
                    .await?;
                self.sync_back(claimed, LineageStatus::Failed, None).await;
                Ok(RecordOutcome::Failed)
            }
        }
    }

    /// Best-effort mirror of a terminal outcome onto the search cache.
    async fn sync_back(&self, record: &LineageRecord, status: LineageStatus, summary: Option<&str>) {
        if let Err(e) = self
            .queue_sync
            .sync_status_back_to_cache(&record.account_id, &record.network_id, status, summary)
            .await
        {
            log::warn!(
                "⚠️  Cache sync-back failed for {}/{}: {}",
                record.account_id,
                record.network_id,
                e
            );
        }
    }

    /// Run one capability against the source chain: first source that
    /// delivers wins; a NotFound is authoritative and short-circuits; other
    /// failures fall through to the next source. An Unknown creator is not a
    /// failure: it falls through too, and is the final answer only when
    /// every source is equally blind.
    async fn over_chain(
        &self,
        plan: &[Arc<dyn DataSource>],
        op: SourceOp,
        account_id: &str,
        network_id: &str,
        config: &PipelineConfig,
    ) -> Result<(SourceOk, DataSourceKind), SourceError> {
        let mut last_error: Option<SourceError> = None;
        let mut unknown_from: Option<DataSourceKind> = None;

        for source in plan {
            match self
                .call_with_retry(source, op, account_id, network_id, config)
                .await
            {
                Ok(SourceOk::Creator(CreatorLookup::Unknown)) => {
                    log::debug!(
                        "{} cannot see creator of {} (pruned history?)",
                        source.kind().as_str(),
                        account_id
                    );
                    unknown_from = Some(source.kind());
                }
                Ok(value) => return Ok((value, source.kind())),
                Err(SourceError::NotFound(msg)) => return Err(SourceError::NotFound(msg)),
                Err(e) => {
                    log::warn!(
                        "⚠️  {} failed for {} during {:?}: {}",
                        source.kind().as_str(),
                        account_id,
                        op,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(kind) = unknown_from {
            // Every source that answered said "can't see it": persist the
            // creator as unresolved rather than failing the record.
            return Ok((SourceOk::Creator(CreatorLookup::Unknown), kind));
        }
        Err(last_error
            .unwrap_or_else(|| SourceError::Permanent("no data sources in plan".to_string())))
    }

    /// One adapter call: rate-limiter wait first, then the call, retrying
    /// transient failures with exponential backoff up to the per-call cap.
    async fn call_with_retry(
        &self,
        source: &Arc<dyn DataSource>,
        op: SourceOp,
        account_id: &str,
        network_id: &str,
        config: &PipelineConfig,
    ) -> Result<SourceOk, SourceError> {
        let mut backoff = ExponentialBackoff::new(500, 8_000, config.call_retry_attempts);
        loop {
            self.limiter
                .wait_if_needed(source.kind())
                .await
                .map_err(|e| SourceError::Transient(format!("rate limiter: {}", e)))?;

            let result = match op {
                SourceOp::Facts => source
                    .fetch_account(account_id, network_id)
                    .await
                    .map(SourceOk::Facts),
                SourceOp::Creator => source
                    .find_creator(account_id, network_id)
                    .await
                    .map(SourceOk::Creator),
                SourceOp::Children => source
                    .find_children(account_id, network_id)
                    .await
                    .map(SourceOk::Children),
                SourceOp::Assets => source
                    .fetch_assets(account_id, network_id)
                    .await
                    .map(SourceOk::Assets),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    log::debug!(
                        "Transient {} failure for {}: {}",
                        source.kind().as_str(),
                        account_id,
                        e
                    );
                    if backoff.sleep().await.is_err() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The cost-guard dry run, with the same rate-limit + retry discipline
    /// as real calls.
    async fn estimate_with_retry(
        &self,
        warehouse: &Arc<dyn DataSource>,
        record: &LineageRecord,
        config: &PipelineConfig,
    ) -> Result<Option<crate::sources::CostEstimate>, SourceError> {
        let mut backoff = ExponentialBackoff::new(500, 8_000, config.call_retry_attempts);
        loop {
            self.limiter
                .wait_if_needed(warehouse.kind())
                .await
                .map_err(|e| SourceError::Transient(format!("rate limiter: {}", e)))?;

            match warehouse
                .estimate_cost(&record.account_id, &record.network_id)
                .await
            {
                Ok(estimate) => return Ok(estimate),
                Err(e) if e.is_transient() => {
                    if backoff.sleep().await.is_err() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryKvStore, RateLimiter};
    use crate::sources::CostEstimate;
    use crate::store::SqliteLineageStore;
    use crate::types::CacheStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// How a mock source answers every capability call.
    #[derive(Clone, Copy, PartialEq)]
    enum MockFailure {
        None,
        NotFound,
        Transient,
        Permanent,
    }

    struct MockSource {
        kind: DataSourceKind,
        failure: MockFailure,
        creator: CreatorLookup,
        children: Vec<String>,
        balance: f64,
        cost: Option<CostEstimate>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockSource {
        fn ok(kind: DataSourceKind) -> Self {
            Self {
                kind,
                failure: MockFailure::None,
                creator: CreatorLookup::Found {
                    creator_account_id: "GPARENT".to_string(),
                    account_created_at: Some(1_600_000_000),
                },
                children: vec!["GCHILD1".to_string(), "GCHILD2".to_string()],
                balance: 2_000_000.0,
                cost: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(kind: DataSourceKind, failure: MockFailure) -> Self {
            Self {
                failure,
                ..Self::ok(kind)
            }
        }

        fn with_cost(mut self, estimated_usd: f64) -> Self {
            self.cost = Some(CostEstimate {
                bytes_scanned: (estimated_usd / 6.25 * (1u64 << 40) as f64) as u64,
                estimated_usd,
            });
            self
        }

        fn with_creator(mut self, creator: CreatorLookup) -> Self {
            self.creator = creator;
            self
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &'static str) -> Result<(), SourceError> {
            self.calls.lock().unwrap().push(op);
            match self.failure {
                MockFailure::None => Ok(()),
                MockFailure::NotFound => Err(SourceError::NotFound("mock 404".to_string())),
                MockFailure::Transient => Err(SourceError::Transient("mock timeout".to_string())),
                MockFailure::Permanent => Err(SourceError::Permanent("mock 400".to_string())),
            }
        }
    }

    #[async_trait::async_trait]
    impl DataSource for MockSource {
        fn kind(&self) -> DataSourceKind {
            self.kind
        }

        async fn estimate_cost(
            &self,
            _account_id: &str,
            _network_id: &str,
        ) -> Result<Option<CostEstimate>, SourceError> {
            self.calls.lock().unwrap().push("estimate");
            Ok(self.cost)
        }

        async fn fetch_account(
            &self,
            _account_id: &str,
            _network_id: &str,
        ) -> Result<AccountFacts, SourceError> {
            self.record("facts")?;
            let mut facts = AccountFacts::from_source(self.kind);
            facts.balance = Some(self.balance);
            facts.home_domain = Some("mock.example".to_string());
            Ok(facts)
        }

        async fn find_creator(
            &self,
            _account_id: &str,
            _network_id: &str,
        ) -> Result<CreatorLookup, SourceError> {
            self.record("creator")?;
            Ok(self.creator.clone())
        }

        async fn find_children(
            &self,
            _account_id: &str,
            _network_id: &str,
        ) -> Result<Vec<String>, SourceError> {
            self.record("children")?;
            Ok(self.children.clone())
        }

        async fn fetch_assets(
            &self,
            _account_id: &str,
            _network_id: &str,
        ) -> Result<serde_json::Value, SourceError> {
            self.record("assets")?;
            Ok(serde_json::json!([{"code": "USD"}]))
        }
    }

    struct Harness {
        _temp: NamedTempFile,
        store: Arc<SqliteLineageStore>,
        orchestrator: PipelineOrchestrator,
        config: PipelineConfig,
    }

    fn harness(
        mode: PipelineMode,
        warehouse: Option<Arc<MockSource>>,
        ledger: Arc<MockSource>,
        index: Arc<MockSource>,
    ) -> Harness {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteLineageStore::open(temp.path().to_str().unwrap()).unwrap());

        let mut config = PipelineConfig::from_env();
        config.db_path = temp.path().to_str().unwrap().to_string();
        config.network_id = "public".to_string();
        config.pipeline_mode = mode;
        config.cost_limit_usd = 0.71;
        config.size_limit_mb = 100_000.0;
        config.batch_size = 10;
        config.max_concurrent = 2;
        config.max_retry_attempts = 3;
        config.call_retry_attempts = 0; // no backoff sleeps in tests
        config.batch_deadline_secs = 30;
        config.ranking_thresholds = vec![1_000_000.0];

        // Unthrottled limiter: no services configured.
        let limiter = Arc::new(RateLimiter::with_limits(
            Arc::new(MemoryKvStore::new()),
            HashMap::new(),
        ));
        let queue_sync = Arc::new(QueueSynchronizer::new(store.clone(), config.cache_ttl_secs));
        let ranking = Arc::new(RankingEngine::new(store.clone()));

        let orchestrator = PipelineOrchestrator::new(
            store.clone(),
            queue_sync,
            limiter,
            ranking,
            warehouse.map(|w| w as Arc<dyn DataSource>),
            ledger as Arc<dyn DataSource>,
            index as Arc<dyn DataSource>,
        );

        Harness {
            _temp: temp,
            store,
            orchestrator,
            config,
        }
    }

    #[tokio::test]
    async fn test_api_only_happy_path() {
        let ledger = Arc::new(MockSource::ok(DataSourceKind::Ledger));
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(PipelineMode::ApiOnly, None, ledger.clone(), index);

        h.store.ensure_config_row(&h.config).await.unwrap();
        h.store
            .upsert_cache_entry("GA", "public", CacheStatus::Pending)
            .await
            .unwrap();

        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.failed, 0);

        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);
        assert_eq!(record.pipeline_source.as_deref(), Some("api"));
        assert_eq!(record.balance, Some(2_000_000.0));
        assert_eq!(record.creator_account_id.as_deref(), Some("GPARENT"));
        assert!(record.assets_blob.is_some());

        // Discovered creator and children were enqueued as PENDING.
        for discovered in ["GPARENT", "GCHILD1", "GCHILD2"] {
            let child = h.store.get(discovered, "public").await.unwrap().unwrap();
            assert_eq!(child.status, LineageStatus::Pending);
            assert_eq!(child.origin, RecordOrigin::Discovery);
        }

        // Terminal outcome mirrored onto the cache.
        let cache = h.store.get_cache_entry("GA", "public").await.unwrap().unwrap();
        assert_eq!(cache.status, CacheStatus::Done);
        assert!(cache.cached_result.unwrap().contains("children_discovered"));

        // The 2M balance entered the 1M leaderboard.
        let standing = h
            .store
            .latest_standing_change("GA", "public", 1_000_000.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            standing.event_type,
            crate::types::StandingChangeType::Entered
        );

        // Monitoring fields written after the batch.
        let (processed, status): (i64, String) = {
            let conn = h.store.raw();
            conn.query_row(
                "SELECT last_run_processed, last_run_status FROM pipeline_config WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap()
        };
        assert_eq!(processed, 1);
        assert_eq!(status, "ok");
    }

    #[tokio::test]
    async fn test_cost_guard_falls_back_to_api() {
        // Warehouse estimates $5.00 against a $0.71 limit with fallback
        // allowed: the record completes via the API path.
        let warehouse =
            Arc::new(MockSource::ok(DataSourceKind::Warehouse).with_cost(5.0));
        let ledger = Arc::new(MockSource::ok(DataSourceKind::Ledger));
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(
            PipelineMode::SourceWithFallback,
            Some(warehouse.clone()),
            ledger.clone(),
            index,
        );

        h.store
            .enqueue("GX", "public", RecordOrigin::Search)
            .await
            .unwrap();
        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.processed, 1);

        let record = h.store.get("GX", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);
        assert_eq!(record.pipeline_source.as_deref(), Some("api"));

        // Only the dry run hit the warehouse; the data calls all went to
        // the APIs.
        assert_eq!(warehouse.calls(), vec!["estimate"]);
        assert!(ledger.calls().contains(&"facts"));
    }

    #[tokio::test]
    async fn test_cost_guard_fatal_without_fallback() {
        let warehouse =
            Arc::new(MockSource::ok(DataSourceKind::Warehouse).with_cost(5.0));
        let ledger = Arc::new(MockSource::ok(DataSourceKind::Ledger));
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(
            PipelineMode::SourceOnly,
            Some(warehouse.clone()),
            ledger,
            index,
        );

        h.store
            .enqueue("GX", "public", RecordOrigin::Search)
            .await
            .unwrap();
        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.failed, 1);

        let record = h.store.get("GX", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Failed);
        assert!(record.last_error.as_deref().unwrap().contains("cost exceeded"));
        assert_eq!(warehouse.calls(), vec!["estimate"]);
    }

    #[tokio::test]
    async fn test_cheap_warehouse_query_runs() {
        let warehouse =
            Arc::new(MockSource::ok(DataSourceKind::Warehouse).with_cost(0.05));
        let ledger = Arc::new(MockSource::ok(DataSourceKind::Ledger));
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(
            PipelineMode::SourceWithFallback,
            Some(warehouse.clone()),
            ledger.clone(),
            index,
        );

        h.store
            .enqueue("GX", "public", RecordOrigin::Search)
            .await
            .unwrap();
        h.orchestrator.run_batch(&h.config).await.unwrap();

        let record = h.store.get("GX", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);
        assert_eq!(record.pipeline_source.as_deref(), Some("warehouse"));
        assert!(warehouse.calls().contains(&"facts"));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_marks_invalid() {
        let ledger = Arc::new(MockSource::failing(
            DataSourceKind::Ledger,
            MockFailure::NotFound,
        ));
        let index = Arc::new(MockSource::failing(
            DataSourceKind::Index,
            MockFailure::NotFound,
        ));
        let h = harness(PipelineMode::ApiOnly, None, ledger, index);

        h.store
            .upsert_cache_entry("GGONE", "public", CacheStatus::Pending)
            .await
            .unwrap();
        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.processed, 1);

        let record = h.store.get("GGONE", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Invalid);

        let cache = h
            .store
            .get_cache_entry("GGONE", "public")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cache.status, CacheStatus::NotFound);

        // Invalid is terminal: the next batch has nothing to do.
        let again = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(again.processed + again.failed + again.skipped, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_then_retry_cap_fails() {
        let ledger = Arc::new(MockSource::failing(
            DataSourceKind::Ledger,
            MockFailure::Transient,
        ));
        let index = Arc::new(MockSource::failing(
            DataSourceKind::Index,
            MockFailure::Transient,
        ));
        let h = harness(PipelineMode::ApiOnly, None, ledger, index);

        h.store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();

        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.failed, 1);
        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Pending);
        assert_eq!(record.retry_count, 1);

        // Burn the remaining budget.
        {
            let conn = h.store.raw();
            conn.execute(
                "UPDATE lineage_records SET retry_count = 3 WHERE account_id = 'GA'",
                [],
            )
            .unwrap();
        }
        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.failed, 1);
        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Failed);
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_lost_claim_counts_skipped() {
        let ledger = Arc::new(MockSource::ok(DataSourceKind::Ledger));
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(PipelineMode::ApiOnly, None, ledger.clone(), index);

        h.store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();

        // Snapshot the batch pull, then let "another worker" win the claim
        // before this one gets to it.
        let due = h.store.due_pending("public", 10).await.unwrap();
        assert_eq!(due.len(), 1);
        h.store.try_claim("GA", "public").await.unwrap().unwrap();

        let outcome = h
            .orchestrator
            .process_record(&due[0], &h.config)
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Skipped);
        // The loser never touched the sources.
        assert!(ledger.calls().is_empty());

        // The winner's claim is untouched.
        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Processing);
    }

    #[tokio::test]
    async fn test_age_routing_skips_warehouse() {
        let warehouse =
            Arc::new(MockSource::ok(DataSourceKind::Warehouse).with_cost(0.05));
        let ledger = Arc::new(MockSource::ok(DataSourceKind::Ledger));
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(
            PipelineMode::SourceWithFallback,
            Some(warehouse.clone()),
            ledger,
            index,
        );

        h.store
            .enqueue("GOLD", "public", RecordOrigin::Search)
            .await
            .unwrap();
        // An account created far past the age cutoff.
        {
            let conn = h.store.raw();
            let ancient = chrono::Utc::now().timestamp()
                - (h.config.instant_query_max_age_days + 100) * 86_400;
            conn.execute(
                "UPDATE lineage_records SET account_created_at = ?1 WHERE account_id = 'GOLD'",
                rusqlite::params![ancient],
            )
            .unwrap();
        }

        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.processed, 1);

        let record = h.store.get("GOLD", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);
        assert_eq!(record.pipeline_source.as_deref(), Some("api"));
        // The warehouse never saw this account, not even for an estimate.
        assert!(warehouse.calls().is_empty());
    }

    #[tokio::test]
    async fn test_creator_fallback_when_history_pruned() {
        let ledger = Arc::new(
            MockSource::ok(DataSourceKind::Ledger).with_creator(CreatorLookup::Unknown),
        );
        let index = Arc::new(MockSource::ok(DataSourceKind::Index).with_creator(
            CreatorLookup::Found {
                creator_account_id: "GDEEP".to_string(),
                account_created_at: None,
            },
        ));
        let h = harness(PipelineMode::ApiOnly, None, ledger.clone(), index.clone());

        h.store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();
        h.orchestrator.run_batch(&h.config).await.unwrap();

        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);
        assert_eq!(record.creator_account_id.as_deref(), Some("GDEEP"));
        assert!(record.creator_resolved);
        // Both sources were consulted for the creator.
        assert!(ledger.calls().contains(&"creator"));
        assert!(index.calls().contains(&"creator"));
    }

    #[tokio::test]
    async fn test_unresolvable_creator_still_completes() {
        let ledger = Arc::new(
            MockSource::ok(DataSourceKind::Ledger).with_creator(CreatorLookup::Unknown),
        );
        let index = Arc::new(
            MockSource::ok(DataSourceKind::Index).with_creator(CreatorLookup::Unknown),
        );
        let h = harness(PipelineMode::ApiOnly, None, ledger, index);

        h.store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();
        let result = h.orchestrator.run_batch(&h.config).await.unwrap();
        assert_eq!(result.processed, 1);

        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);
        assert!(record.creator_account_id.is_none());
        assert!(!record.creator_resolved);
    }

    #[tokio::test]
    async fn test_discovery_is_cycle_safe() {
        // A pathological child list pointing back at the account itself and
        // at an already-tracked account must not reset anything.
        let mut ledger = MockSource::ok(DataSourceKind::Ledger);
        ledger.children = vec!["GA".to_string(), "GKNOWN".to_string()];
        let ledger = Arc::new(ledger);
        let index = Arc::new(MockSource::ok(DataSourceKind::Index));
        let h = harness(PipelineMode::ApiOnly, None, ledger, index);

        h.store
            .enqueue("GKNOWN", "public", RecordOrigin::Search)
            .await
            .unwrap();
        h.store.try_claim("GKNOWN", "public").await.unwrap().unwrap();
        h.store
            .mark_invalid("GKNOWN", "public", "HTTP 404")
            .await
            .unwrap();

        h.store
            .enqueue("GA", "public", RecordOrigin::Search)
            .await
            .unwrap();
        h.orchestrator.run_batch(&h.config).await.unwrap();

        let record = h.store.get("GA", "public").await.unwrap().unwrap();
        assert_eq!(record.status, LineageStatus::Complete);

        // The self-reference did not reset GA; the known record kept its
        // terminal status.
        let known = h.store.get("GKNOWN", "public").await.unwrap().unwrap();
        assert_eq!(known.status, LineageStatus::Invalid);
    }
}
