//! Stuck-record monitor
//!
//! A batch that dies mid-pipeline leaves its claims in an in-flight status.
//! Nothing rolls those back at failure time; the claim is a row, not a held
//! lock. Instead this monitor periodically scans for
//! in-flight records that stopped advancing and either requeues them or,
//! once the retry budget is spent, fails them for good.

use crate::config::PipelineConfig;
use crate::store::LineageStore;
use crate::types::StuckInfo;
use crate::BoxError;
use std::sync::Arc;

/// What `reset` did with a stuck record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Returned to PENDING with an incremented retry count.
    Requeued,
    /// Retry budget exhausted; transitioned to FAILED.
    Failed,
}

pub struct StuckMonitor {
    store: Arc<dyn LineageStore>,
    config: PipelineConfig,
}

impl StuckMonitor {
    pub fn new(store: Arc<dyn LineageStore>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Scan in-flight records whose `updated_at` is strictly older than the
    /// per-origin threshold. A record exactly at the boundary is not stuck.
    /// Terminal records are never scanned; the store's in-flight query
    /// excludes them structurally.
    pub async fn detect_stuck(&self, now: i64) -> Result<Vec<StuckInfo>, BoxError> {
        let inflight = self.store.inflight_records(&self.config.network_id).await?;

        let mut stuck = Vec::new();
        for record in inflight {
            let threshold = self.config.stuck_threshold_secs(record.origin);
            let stalled_for = now - record.updated_at;
            if stalled_for > threshold {
                stuck.push(StuckInfo {
                    account_id: record.account_id,
                    network_id: record.network_id,
                    status: record.status,
                    origin: record.origin,
                    retry_count: record.retry_count,
                    stalled_for_secs: stalled_for,
                });
            }
        }
        Ok(stuck)
    }

    /// Reclaim one stuck record: requeue it, or fail it once the retry
    /// budget is spent. This is the only path that regresses an in-flight
    /// record's status.
    pub async fn reset(&self, info: &StuckInfo, reason: &str) -> Result<ResetOutcome, BoxError> {
        if info.retry_count >= self.config.max_retry_attempts {
            let error = format!(
                "stuck in {} after {} retries: {}",
                info.status.as_str(),
                info.retry_count,
                reason
            );
            self.store
                .fail(&info.account_id, &info.network_id, &error)
                .await?;
            log::warn!(
                "❌ {}/{} failed permanently ({})",
                info.account_id,
                info.network_id,
                error
            );
            return Ok(ResetOutcome::Failed);
        }

        self.store
            .return_to_pending(&info.account_id, &info.network_id, reason)
            .await?;
        log::info!(
            "🔄 Requeued stuck record {}/{} (stalled {}s in {})",
            info.account_id,
            info.network_id,
            info.stalled_for_secs,
            info.status.as_str()
        );
        Ok(ResetOutcome::Requeued)
    }

    /// One full scan-and-reclaim pass. Per-record errors are logged and
    /// counted, never fatal for the pass.
    pub async fn run_once(&self, now: i64) -> Result<(usize, usize), BoxError> {
        let stuck = self.detect_stuck(now).await?;
        if stuck.is_empty() {
            return Ok((0, 0));
        }

        log::info!("🔎 Stuck scan found {} stalled records", stuck.len());
        let mut requeued = 0;
        let mut failed = 0;
        for info in &stuck {
            let reason = format!("no progress for {}s", info.stalled_for_secs);
            match self.reset(info, &reason).await {
                Ok(ResetOutcome::Requeued) => requeued += 1,
                Ok(ResetOutcome::Failed) => failed += 1,
                Err(e) => {
                    log::error!(
                        "❌ Failed to reset {}/{}: {}",
                        info.account_id,
                        info.network_id,
                        e
                    );
                }
            }
        }
        Ok((requeued, failed))
    }
}
