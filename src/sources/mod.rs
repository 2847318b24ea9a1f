//! Data source adapters
//!
//! Three independent clients feed the pipeline: the analytics warehouse
//! (`warehouse`), the ledger-replica REST API (`ledger`), and the third-party
//! indexing API (`index_api`). Each one implements the same `DataSource`
//! capability set so the orchestrator stays polymorphic over strategy order,
//! and each returns the normalized `AccountFacts` shape instead of its raw
//! response format.

pub mod index_api;
pub mod ledger;
pub mod warehouse;

use crate::types::{AccountFacts, CreatorLookup, DataSourceKind};
use async_trait::async_trait;

pub use index_api::IndexApiClient;
pub use ledger::LedgerApiClient;
pub use warehouse::WarehouseClient;

/// Typed adapter failure, classified once at the adapter boundary so the
/// orchestrator never inspects error strings.
#[derive(Debug)]
pub enum SourceError {
    /// Network timeout, connection failure, 5xx: retry with backoff.
    Transient(String),
    /// HTTP 429 from the upstream: retryable, and a signal the shared rate
    /// limiter is running hot.
    RateLimited(String),
    /// The upstream authoritatively reports the account does not exist
    /// (HTTP 404 for the account itself). Terminal for the record.
    NotFound(String),
    /// The cost guard refused a warehouse query. Not a failure of the
    /// upstream; the strategy decides between fallback and FAILED.
    CostBlocked {
        estimated_usd: f64,
        estimated_mb: f64,
    },
    /// Anything else (malformed response, 4xx other than 404/429).
    Permanent(String),
}

impl SourceError {
    /// Transient errors are retried by the per-call backoff; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::RateLimited(_))
    }

    /// Classify a reqwest transport error (no HTTP status available).
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SourceError::Transient(err.to_string())
        } else if err.is_decode() {
            SourceError::Permanent(format!("undecodable response: {}", err))
        } else {
            SourceError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status. `account_scoped` marks requests
    /// where a 404 speaks about the account itself rather than a sub-resource.
    pub fn from_status(status: reqwest::StatusCode, context: &str, account_scoped: bool) -> Self {
        if status.as_u16() == 404 && account_scoped {
            SourceError::NotFound(context.to_string())
        } else if status.as_u16() == 429 {
            SourceError::RateLimited(context.to_string())
        } else if status.is_server_error() {
            SourceError::Transient(format!("{}: HTTP {}", context, status))
        } else {
            SourceError::Permanent(format!("{}: HTTP {}", context, status))
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Transient(msg) => write!(f, "transient source error: {}", msg),
            SourceError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            SourceError::NotFound(msg) => write!(f, "account not found: {}", msg),
            SourceError::CostBlocked {
                estimated_usd,
                estimated_mb,
            } => write!(
                f,
                "query blocked by cost guard (est ${:.2}, {:.1} MB)",
                estimated_usd, estimated_mb
            ),
            SourceError::Permanent(msg) => write!(f, "permanent source error: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Pre-flight estimate for a cost-guarded query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub bytes_scanned: u64,
    pub estimated_usd: f64,
}

impl CostEstimate {
    pub fn megabytes(&self) -> f64 {
        self.bytes_scanned as f64 / (1024.0 * 1024.0)
    }
}

/// Capability set every adapter provides. Phases map onto these one-to-one:
/// facts -> `fetch_account`, creator discovery -> `find_creator`, child
/// discovery -> `find_children`, asset enrichment -> `fetch_assets`.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn kind(&self) -> DataSourceKind;

    /// Pre-flight cost for processing this account through this source.
    /// `None` means the source is not cost-guarded (the REST APIs).
    async fn estimate_cost(
        &self,
        _account_id: &str,
        _network_id: &str,
    ) -> Result<Option<CostEstimate>, SourceError> {
        Ok(None)
    }

    /// Current account facts (balance, home domain, flags, attributes).
    async fn fetch_account(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<AccountFacts, SourceError>;

    /// Who created this account. `Unknown` means this source cannot see far
    /// enough back (e.g. pruned ledger history) and a fallback source should
    /// be consulted.
    async fn find_creator(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<CreatorLookup, SourceError>;

    /// Accounts this account created.
    async fn find_children(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Vec<String>, SourceError>;

    /// Asset/trustline enrichment, as an opaque JSON blob.
    async fn fetch_assets(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<serde_json::Value, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SourceError::Transient("timeout".into()).is_transient());
        assert!(SourceError::RateLimited("429".into()).is_transient());
        assert!(!SourceError::NotFound("404".into()).is_transient());
        assert!(!SourceError::Permanent("400".into()).is_transient());
        assert!(!SourceError::CostBlocked {
            estimated_usd: 5.0,
            estimated_mb: 100.0
        }
        .is_transient());
    }

    #[test]
    fn test_status_classification() {
        let not_found =
            SourceError::from_status(reqwest::StatusCode::NOT_FOUND, "account GA", true);
        assert!(matches!(not_found, SourceError::NotFound(_)));

        // A 404 on a sub-resource is not an account-does-not-exist signal.
        let sub_resource =
            SourceError::from_status(reqwest::StatusCode::NOT_FOUND, "operations page", false);
        assert!(matches!(sub_resource, SourceError::Permanent(_)));

        let throttled =
            SourceError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "ledger", true);
        assert!(matches!(throttled, SourceError::RateLimited(_)));

        let server =
            SourceError::from_status(reqwest::StatusCode::BAD_GATEWAY, "warehouse", false);
        assert!(matches!(server, SourceError::Transient(_)));

        let client = SourceError::from_status(reqwest::StatusCode::BAD_REQUEST, "ledger", true);
        assert!(matches!(client, SourceError::Permanent(_)));
    }

    #[test]
    fn test_cost_estimate_megabytes() {
        let estimate = CostEstimate {
            bytes_scanned: 512 * 1024 * 1024,
            estimated_usd: 0.01,
        };
        assert_eq!(estimate.megabytes(), 512.0);
    }
}
