//! Ranking engine for high-value-account leaderboards
//!
//! Each configured balance threshold is an independent leaderboard. Rankings
//! are computed on demand from persisted balances; standing changes are
//! classified against the latest prior event for the account+threshold and
//! appended to an immutable log.

use crate::store::LineageStore;
use crate::types::{LineageRecord, StandingChangeEvent, StandingChangeType};
use crate::BoxError;
use std::sync::Arc;

/// Classification knobs, together so operators tune them in one place.
mod standing_thresholds {
    /// Rank moves smaller than this are not RANK_UP/RANK_DOWN events.
    pub const MIN_RANK_DELTA: i64 = 1;
    /// Balance moves below this ratio (with an unchanged rank) are ignored.
    pub const BALANCE_MOVE_RATIO: f64 = 0.05;
}

pub struct RankingEngine {
    store: Arc<dyn LineageStore>,
}

impl RankingEngine {
    pub fn new(store: Arc<dyn LineageStore>) -> Self {
        Self { store }
    }

    /// Leaderboard for one threshold: balance descending, ties broken by
    /// account_id ascending, 1-indexed, truncated to `limit`. Deterministic
    /// for unchanged data.
    pub async fn current_rankings(
        &self,
        network_id: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<(i64, LineageRecord)>, BoxError> {
        let mut records = self
            .store
            .records_with_balance_at_least(network_id, threshold)
            .await?;

        records.sort_by(|a, b| {
            let balance_a = a.balance.unwrap_or(0.0);
            let balance_b = b.balance.unwrap_or(0.0);
            balance_b
                .partial_cmp(&balance_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.account_id.cmp(&b.account_id))
        });

        Ok(records
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, record)| (i as i64 + 1, record))
            .collect())
    }

    /// Current rank of one account on the full (untruncated) leaderboard.
    async fn rank_of(
        &self,
        network_id: &str,
        threshold: f64,
        account_id: &str,
    ) -> Result<Option<i64>, BoxError> {
        let rankings = self
            .current_rankings(network_id, threshold, usize::MAX)
            .await?;
        Ok(rankings
            .iter()
            .find(|(_, record)| record.account_id == account_id)
            .map(|(rank, _)| *rank))
    }

    /// Classify a balance update against one threshold and append the event
    /// when it changes the account's standing. Returns `None` when nothing
    /// noteworthy happened.
    ///
    /// The record's new balance must already be persisted; the rank is
    /// computed from the store, not from the arguments.
    pub async fn detect_and_record_change(
        &self,
        record: &LineageRecord,
        old_balance: f64,
        new_balance: f64,
        threshold: f64,
    ) -> Result<Option<StandingChangeEvent>, BoxError> {
        use standing_thresholds::*;

        let previous = self
            .store
            .latest_standing_change(&record.account_id, &record.network_id, threshold)
            .await?;
        let previous_rank = previous.as_ref().and_then(|event| event.new_rank);

        let qualifies_now = new_balance >= threshold;
        let current_rank = if qualifies_now {
            self.rank_of(&record.network_id, threshold, &record.account_id)
                .await?
        } else {
            None
        };

        if qualifies_now && current_rank.is_none() {
            log::warn!(
                "⚠️  {} qualifies for threshold {} but has no persisted rank; \
                 balance not yet written?",
                record.account_id,
                threshold
            );
            return Ok(None);
        }

        let event_type = match (previous_rank, current_rank) {
            (None, Some(_)) if qualifies_now => Some(StandingChangeType::Entered),
            (Some(_), _) if !qualifies_now => Some(StandingChangeType::Exited),
            (Some(prev), Some(current)) => {
                if current + MIN_RANK_DELTA <= prev {
                    Some(StandingChangeType::RankUp)
                } else if current >= prev + MIN_RANK_DELTA {
                    Some(StandingChangeType::RankDown)
                } else if old_balance > 0.0
                    && (new_balance - old_balance).abs() / old_balance >= BALANCE_MOVE_RATIO
                {
                    if new_balance > old_balance {
                        Some(StandingChangeType::BalanceIncrease)
                    } else {
                        Some(StandingChangeType::BalanceDecrease)
                    }
                } else {
                    None
                }
            }
            _ => None,
        };

        let event_type = match event_type {
            Some(event_type) => event_type,
            None => return Ok(None),
        };

        let event = StandingChangeEvent {
            account_id: record.account_id.clone(),
            network_id: record.network_id.clone(),
            event_type,
            old_rank: match event_type {
                StandingChangeType::Entered => None,
                _ => previous_rank,
            },
            new_rank: match event_type {
                StandingChangeType::Exited => None,
                _ => current_rank,
            },
            old_balance,
            new_balance,
            threshold,
            created_at: chrono::Utc::now().timestamp(),
        };

        self.store.append_standing_change(&event).await?;
        log::info!(
            "🏆 Standing change for {}: {} (rank {:?} -> {:?}, threshold {})",
            event.account_id,
            event.event_type.as_str(),
            event.old_rank,
            event.new_rank,
            threshold
        );
        Ok(Some(event))
    }
}
