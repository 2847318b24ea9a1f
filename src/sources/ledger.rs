//! Ledger-replica REST API adapter
//!
//! The ledger API serves current account state and the account's operation
//! history. Operations are fetched ascending (earliest first) so the
//! account's own `create_account` operation, and therefore its creator,
//! shows up on the first page when the replica still has that history.
//! A replica with pruned history yields `CreatorLookup::Unknown`, which sends
//! the orchestrator to the indexing API instead.

use super::{DataSource, SourceError};
use crate::types::{AccountFacts, CreatorLookup, DataSourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// Hard cap on operation pages walked per account; a hub account that funded
/// tens of thousands of children gets truncated here rather than holding a
/// worker for minutes.
const MAX_OPERATION_PAGES: u32 = 20;

const CREATE_ACCOUNT_OP: &str = "create_account";

#[derive(Debug, Clone, Deserialize)]
struct LedgerAccount {
    #[serde(rename = "id")]
    _id: String,
    #[serde(default)]
    balances: Vec<LedgerBalance>,
    home_domain: Option<String>,
    #[serde(default)]
    flags: i64,
    #[serde(default)]
    data: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerBalance {
    asset_type: String,
    balance: String,
    #[serde(default)]
    asset_code: Option<String>,
    #[serde(default)]
    asset_issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationRecord {
    paging_token: String,
    #[serde(rename = "type")]
    op_type: String,
    created_at: String,
    /// The account the operation acted on (for create_account: the created
    /// account).
    account: Option<String>,
    /// The funding account of a create_account operation.
    funder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationsPage {
    #[serde(default)]
    records: Vec<OperationRecord>,
}

/// Ledger-replica REST client.
pub struct LedgerApiClient {
    client: reqwest::Client,
    base_url: String,
    page_limit: u32,
}

impl LedgerApiClient {
    pub fn new(base_url: &str, page_limit: u32) -> Result<Self, crate::BoxError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_limit,
        })
    }

    async fn get_account(&self, account_id: &str) -> Result<LedgerAccount, SourceError> {
        let url = format!("{}/accounts/{}", self.base_url, account_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(SourceError::from_transport)?;

        if !response.status().is_success() {
            return Err(SourceError::from_status(
                response.status(),
                &format!("ledger account {}", account_id),
                true,
            ));
        }

        response
            .json::<LedgerAccount>()
            .await
            .map_err(SourceError::from_transport)
    }

    async fn operations_page(
        &self,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Result<OperationsPage, SourceError> {
        let url = format!("{}/accounts/{}/operations", self.base_url, account_id);
        let mut request = self
            .client
            .get(&url)
            .query(&[("order", "asc"), ("limit", &self.page_limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await.map_err(SourceError::from_transport)?;
        if !response.status().is_success() {
            // A 404 here is still about the account: operations are scoped
            // under it.
            return Err(SourceError::from_status(
                response.status(),
                &format!("ledger operations for {}", account_id),
                true,
            ));
        }

        response
            .json::<OperationsPage>()
            .await
            .map_err(SourceError::from_transport)
    }

    fn parse_op_time(raw: &str) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp())
    }

    fn native_balance(account: &LedgerAccount) -> Option<f64> {
        account
            .balances
            .iter()
            .find(|b| b.asset_type == "native")
            .and_then(|b| b.balance.parse().ok())
    }
}

#[async_trait]
impl DataSource for LedgerApiClient {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Ledger
    }

    async fn fetch_account(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<AccountFacts, SourceError> {
        let account = self.get_account(account_id).await?;

        let mut facts = AccountFacts::from_source(DataSourceKind::Ledger);
        facts.balance = Self::native_balance(&account);
        facts.home_domain = account.home_domain.clone();
        facts.flags = Some(account.flags);
        if !account.data.is_empty() {
            facts.attributes = Some(Value::Object(account.data.clone()));
        }
        Ok(facts)
    }

    async fn find_creator(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<CreatorLookup, SourceError> {
        // Earliest-first: the creation operation, if the replica still has
        // it, is on the first page.
        let page = self.operations_page(account_id, None).await?;

        if page.records.is_empty() {
            // No history at all on this replica: pruned, not authoritative.
            return Ok(CreatorLookup::Unknown);
        }

        for record in &page.records {
            if record.op_type == CREATE_ACCOUNT_OP
                && record.account.as_deref() == Some(account_id)
            {
                match &record.funder {
                    Some(funder) => {
                        return Ok(CreatorLookup::Found {
                            creator_account_id: funder.clone(),
                            account_created_at: Self::parse_op_time(&record.created_at),
                        })
                    }
                    None => return Ok(CreatorLookup::Root),
                }
            }
        }

        // History present but starts after creation: pruned replica.
        Ok(CreatorLookup::Unknown)
    }

    async fn find_children(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<Vec<String>, SourceError> {
        let mut children = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 0..MAX_OPERATION_PAGES {
            let page = self.operations_page(account_id, cursor.as_deref()).await?;
            if page.records.is_empty() {
                break;
            }

            for record in &page.records {
                if record.op_type == CREATE_ACCOUNT_OP
                    && record.funder.as_deref() == Some(account_id)
                {
                    if let Some(created) = &record.account {
                        children.push(created.clone());
                    }
                }
            }

            let full_page = page.records.len() as u32 >= self.page_limit;
            cursor = page.records.last().map(|r| r.paging_token.clone());
            if !full_page {
                break;
            }
            if page_no + 1 == MAX_OPERATION_PAGES {
                log::warn!(
                    "⚠️  Truncated child discovery for {} at {} pages",
                    account_id,
                    MAX_OPERATION_PAGES
                );
            }
        }

        Ok(children)
    }

    async fn fetch_assets(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<Value, SourceError> {
        let account = self.get_account(account_id).await?;
        let assets: Vec<Value> = account
            .balances
            .iter()
            .filter(|b| b.asset_type != "native")
            .map(|b| {
                serde_json::json!({
                    "asset_code": b.asset_code,
                    "asset_issuer": b.asset_issuer,
                    "balance": b.balance,
                })
            })
            .collect();
        Ok(Value::Array(assets))
    }
}
