//! Third-party indexing API adapter
//!
//! The indexer keeps full-history creator/child relationships even where the
//! ledger replica has pruned its operation log, which makes it the fallback
//! for creator discovery. It is also the cheapest asset-list source.

use super::{DataSource, SourceError};
use crate::types::{AccountFacts, CreatorLookup, DataSourceKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct IndexAccount {
    #[serde(rename = "account")]
    _account: String,
    created_by: Option<String>,
    created_at: Option<i64>,
    /// Set when the indexer knows the account is a network-genesis account.
    #[serde(default)]
    genesis: bool,
    balance: Option<f64>,
    home_domain: Option<String>,
    #[serde(default)]
    assets: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CreatedAccountsResponse {
    #[serde(default)]
    accounts: Vec<String>,
}

/// Indexing API client.
pub struct IndexApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl IndexApiClient {
    pub fn new(base_url: &str) -> Result<Self, crate::BoxError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_account(&self, account_id: &str) -> Result<IndexAccount, SourceError> {
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
                &format!("index account {}", account_id),
                true,
            ));
        }

        response
            .json::<IndexAccount>()
            .await
            .map_err(SourceError::from_transport)
    }
}

#[async_trait]
impl DataSource for IndexApiClient {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Index
    }

    async fn fetch_account(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<AccountFacts, SourceError> {
        let account = self.get_account(account_id).await?;

        let mut facts = AccountFacts::from_source(DataSourceKind::Index);
        facts.balance = account.balance;
        facts.home_domain = account.home_domain;
        facts.account_created_at = account.created_at;
        Ok(facts)
    }

    async fn find_creator(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<CreatorLookup, SourceError> {
        let account = self.get_account(account_id).await?;

        if let Some(creator) = account.created_by {
            return Ok(CreatorLookup::Found {
                creator_account_id: creator,
                account_created_at: account.created_at,
            });
        }
        if account.genesis {
            return Ok(CreatorLookup::Root);
        }
        Ok(CreatorLookup::Unknown)
    }

    async fn find_children(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/accounts/{}/created", self.base_url, account_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(SourceError::from_transport)?;

        if !response.status().is_success() {
            return Err(SourceError::from_status(
                response.status(),
                &format!("index created-accounts for {}", account_id),
                true,
            ));
        }

        let created: CreatedAccountsResponse =
            response.json().await.map_err(SourceError::from_transport)?;
        Ok(created.accounts)
    }

    async fn fetch_assets(
        &self,
        account_id: &str,
        _network_id: &str,
    ) -> Result<Value, SourceError> {
        let account = self.get_account(account_id).await?;
        Ok(Value::Array(account.assets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_parsing() {
        let raw = r#"{
            "account": "GCHILD",
            "created_by": "GPARENT",
            "created_at": 1614556800,
            "balance": 150.25,
            "home_domain": "issuer.example",
            "assets": [{"code": "USD", "issuer": "GISSUER", "balance": "10.0"}]
        }"#;
        let account: IndexAccount = serde_json::from_str(raw).unwrap();
        assert_eq!(account.created_by.as_deref(), Some("GPARENT"));
        assert_eq!(account.created_at, Some(1_614_556_800));
        assert!(!account.genesis);
        assert_eq!(account.assets.len(), 1);
    }

    #[test]
    fn test_genesis_account_parsing() {
        let raw = r#"{"account": "GROOT", "created_by": null, "genesis": true}"#;
        let account: IndexAccount = serde_json::from_str(raw).unwrap();
        assert!(account.genesis);
        assert!(account.created_by.is_none());
    }

    #[test]
    fn test_created_accounts_parsing() {
        let raw = r#"{"accounts": ["GA1", "GA2", "GA3"]}"#;
        let response: CreatedAccountsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.accounts, vec!["GA1", "GA2", "GA3"]);

        let empty: CreatedAccountsResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.accounts.is_empty());
    }
}
