//! Analytics warehouse adapter
//!
//! Talks to the warehouse's query-job endpoint. Every query is submitted as a
//! parameterized job (named parameters in a JSON payload; account IDs are
//! never spliced into SQL text) and can be dry-run first, returning only the
//! estimated bytes scanned. The orchestrator's cost guard multiplies that by
//! the configured price per TiB before allowing the real run.

use super::{CostEstimate, DataSource, SourceError};
use crate::types::{AccountFacts, CreatorLookup, DataSourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

const BYTES_PER_TIB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;

const ACCOUNT_FACTS_SQL: &str = "SELECT balance, home_domain, flags, attributes \
     FROM account_current \
     WHERE account_id = @account_id AND network_id = @network_id";

const CREATION_OP_SQL: &str = "SELECT funder_account_id, created_at \
     FROM account_creation_ops \
     WHERE created_account_id = @account_id AND network_id = @network_id \
     ORDER BY ledger_time ASC LIMIT 1";

const CHILDREN_SQL: &str = "SELECT created_account_id \
     FROM account_creation_ops \
     WHERE funder_account_id = @account_id AND network_id = @network_id \
     ORDER BY ledger_time ASC LIMIT @row_limit";

const TRUST_LINES_SQL: &str = "SELECT asset_code, asset_issuer, balance \
     FROM trust_lines \
     WHERE account_id = @account_id AND network_id = @network_id \
     LIMIT @row_limit";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
    #[serde(rename = "totalBytesProcessed", default)]
    total_bytes_processed: u64,
}

/// Warehouse query client.
pub struct WarehouseClient {
    client: reqwest::Client,
    base_url: String,
    price_per_tib_usd: f64,
    row_limit: u32,
}

impl WarehouseClient {
    pub fn new(
        base_url: &str,
        price_per_tib_usd: f64,
        row_limit: u32,
    ) -> Result<Self, crate::BoxError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            price_per_tib_usd,
            row_limit,
        })
    }

    pub fn price_for_bytes(&self, bytes: u64) -> f64 {
        bytes as f64 / BYTES_PER_TIB * self.price_per_tib_usd
    }

    fn params(&self, account_id: &str, network_id: &str) -> Value {
        json!({
            "account_id": account_id,
            "network_id": network_id,
            "row_limit": self.row_limit,
        })
    }

    async fn run_query(
        &self,
        sql: &str,
        params: Value,
        dry_run: bool,
    ) -> Result<QueryResponse, SourceError> {
        let url = format!("{}/v1/query", self.base_url);
        let body = json!({
            "sql": sql,
            "params": params,
            "dryRun": dry_run,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(SourceError::from_transport)?;

        if !response.status().is_success() {
            // Warehouse 404s are endpoint problems, never account existence.
            return Err(SourceError::from_status(
                response.status(),
                "warehouse query",
                false,
            ));
        }

        response
            .json::<QueryResponse>()
            .await
            .map_err(SourceError::from_transport)
    }

    fn row_f64(row: &Map<String, Value>, key: &str) -> Option<f64> {
        match row.get(key) {
            Some(Value::Number(n)) => n.as_f64(),
            // Warehouses commonly serialize numerics as strings.
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    fn row_i64(row: &Map<String, Value>, key: &str) -> Option<i64> {
        match row.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    fn row_string(row: &Map<String, Value>, key: &str) -> Option<String> {
        row.get(key).and_then(Value::as_str).map(str::to_string)
    }
}

#[async_trait]
impl DataSource for WarehouseClient {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Warehouse
    }

    /// Dry-run the two historical scans (creator + children). Those dominate
    /// cost; the current-state lookups are clustered and negligible.
    async fn estimate_cost(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Option<CostEstimate>, SourceError> {
        let creator = self
            .run_query(CREATION_OP_SQL, self.params(account_id, network_id), true)
            .await?;
        let children = self
            .run_query(CHILDREN_SQL, self.params(account_id, network_id), true)
            .await?;

        let bytes = creator.total_bytes_processed + children.total_bytes_processed;
        Ok(Some(CostEstimate {
            bytes_scanned: bytes,
            estimated_usd: self.price_for_bytes(bytes),
        }))
    }

    async fn fetch_account(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<AccountFacts, SourceError> {
        let response = self
            .run_query(ACCOUNT_FACTS_SQL, self.params(account_id, network_id), false)
            .await?;

        let row = response.rows.first().ok_or_else(|| {
            // Absence from the warehouse is not authoritative (replication
            // lag); let the orchestrator fall back to a live source.
            SourceError::Permanent(format!("account {} not present in warehouse", account_id))
        })?;

        let mut facts = AccountFacts::from_source(DataSourceKind::Warehouse);
        facts.balance = Self::row_f64(row, "balance");
        facts.home_domain = Self::row_string(row, "home_domain");
        facts.flags = Self::row_i64(row, "flags");
        facts.attributes = row.get("attributes").cloned();
        Ok(facts)
    }

    async fn find_creator(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<CreatorLookup, SourceError> {
        let response = self
            .run_query(CREATION_OP_SQL, self.params(account_id, network_id), false)
            .await?;

        match response.rows.first() {
            Some(row) => {
                let funder = Self::row_string(row, "funder_account_id").ok_or_else(|| {
                    SourceError::Permanent("creation op row missing funder".to_string())
                })?;
                Ok(CreatorLookup::Found {
                    creator_account_id: funder,
                    account_created_at: Self::row_i64(row, "created_at"),
                })
            }
            // The warehouse history is complete: no creation op means the
            // account predates account-creation ops (a root account).
            None => Ok(CreatorLookup::Root),
        }
    }

    async fn find_children(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Vec<String>, SourceError> {
        let response = self
            .run_query(CHILDREN_SQL, self.params(account_id, network_id), false)
            .await?;

        Ok(response
            .rows
            .iter()
            .filter_map(|row| Self::row_string(row, "created_account_id"))
            .collect())
    }

    async fn fetch_assets(
        &self,
        account_id: &str,
        network_id: &str,
    ) -> Result<Value, SourceError> {
        let response = self
            .run_query(TRUST_LINES_SQL, self.params(account_id, network_id), false)
            .await?;

        Ok(Value::Array(
            response.rows.into_iter().map(Value::Object).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> WarehouseClient {
        WarehouseClient::new("http://localhost:9050", 6.25, 1000).unwrap()
    }

    #[test]
    fn test_price_per_tib() {
        let c = client();
        assert_eq!(c.price_for_bytes(0), 0.0);
        // One TiB at $6.25/TiB.
        assert!((c.price_for_bytes(1u64 << 40) - 6.25).abs() < 1e-9);
        // 800 GiB ≈ $4.88.
        let estimated = c.price_for_bytes(800 * (1u64 << 30));
        assert!((estimated - 4.8828125).abs() < 1e-6);
    }

    #[test]
    fn test_queries_use_bound_parameters() {
        // Account IDs travel in the params payload, never in SQL text.
        for sql in [ACCOUNT_FACTS_SQL, CREATION_OP_SQL, CHILDREN_SQL, TRUST_LINES_SQL] {
            assert!(sql.contains("@account_id"));
            assert!(sql.contains("@network_id"));
            assert!(!sql.contains('\''));
        }

        let params = client().params("GABC", "public");
        assert_eq!(params["account_id"], "GABC");
        assert_eq!(params["network_id"], "public");
        assert_eq!(params["row_limit"], 1000);
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "rows": [
                {"balance": "2000000.5", "home_domain": "anchor.example", "flags": 4}
            ],
            "totalBytesProcessed": 1048576
        }"#;
        let response: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.total_bytes_processed, 1_048_576);
        let row = &response.rows[0];
        assert_eq!(WarehouseClient::row_f64(row, "balance"), Some(2_000_000.5));
        assert_eq!(
            WarehouseClient::row_string(row, "home_domain").as_deref(),
            Some("anchor.example")
        );
        assert_eq!(WarehouseClient::row_i64(row, "flags"), Some(4));
        assert_eq!(WarehouseClient::row_f64(row, "missing"), None);
    }

    #[test]
    fn test_dry_run_only_response() {
        let raw = r#"{"totalBytesProcessed": 5497558138880}"#;
        let response: QueryResponse = serde_json::from_str(raw).unwrap();
        assert!(response.rows.is_empty());
        // ~5 TiB -> ~$31 at the default price: well past any sane limit.
        let usd = client().price_for_bytes(response.total_bytes_processed);
        assert!(usd > 30.0);
    }
}
