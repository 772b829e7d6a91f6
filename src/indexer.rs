//! Upstream chain indexer client
//!
//! The indexer exposes `GET {base}/api/{path}?since_block=N` feeds returning
//! JSON arrays. Field names are fixed by the indexer and matched exactly.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::IndexerConfig;
use crate::error::{PassportError, Result};

/// Indexer feed paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedPath {
    SupsWithdrawBsc,
    SupsWithdrawEth,
    SupsDepositBsc,
    SupsDepositEth,
    NftTokens,
    BnbPurchases,
    BusdPurchases,
    EthPurchases,
    UsdcPurchases,
}

impl FeedPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedPath::SupsWithdrawBsc => "sups_withdraw_txs",
            FeedPath::SupsWithdrawEth => "sups_eth_withdraw_txs",
            FeedPath::SupsDepositBsc => "sups_deposit_txs",
            FeedPath::SupsDepositEth => "sups_eth_deposit_txs",
            FeedPath::NftTokens => "nft_tokens",
            FeedPath::BnbPurchases => "bnb_txs",
            FeedPath::BusdPurchases => "busd_txs",
            FeedPath::EthPurchases => "eth_txs",
            FeedPath::UsdcPurchases => "usdc_txs",
        }
    }
}

/// SUPS moving in or out of the platform (deposits and withdrawals)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupTransferRecord {
    pub tx_hash: String,
    #[serde(default)]
    pub log_index: u64,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub chain: i64,
    pub block_number: u64,
    #[serde(default)]
    pub confirmations: u64,
    pub from_address: String,
    pub to_address: String,
    #[serde(default)]
    pub contract_address: String,
    pub value_int: String,
    pub value_decimals: u32,
}

/// SUPS bought with native tokens or stablecoins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRecord {
    #[serde(default)]
    pub chain: i64,
    pub block_number: u64,
    #[serde(default)]
    pub confirmations: u64,
    pub from_address: String,
    pub to_address: String,
    #[serde(default)]
    pub contract_address: String,
    pub value_int: String,
    pub value_decimals: u32,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub usd_rate: String,
    pub sups: String,
    pub tx_hash: String,
}

/// Latest known transfer of an NFT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftOwnerRecord {
    pub tx_hash: String,
    #[serde(default)]
    pub log_index: u64,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub chain: i64,
    pub block_number: u64,
    #[serde(default)]
    pub confirmations: u64,
    pub from_address: String,
    pub to_address: String,
    #[serde(default)]
    pub contract_address: String,
    pub token_id: u64,
}

/// Source of external chain events. Implemented by [`IndexerClient`] and by
/// in-memory fakes in tests.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn sup_transfers(&self, path: FeedPath, since_block: u64) -> Result<Vec<SupTransferRecord>>;

    async fn purchases(&self, path: FeedPath, since_block: u64) -> Result<Vec<PurchaseRecord>>;

    /// Current owner records for every token of `contract`
    async fn nft_owners(&self, contract: &str) -> Result<Vec<NftOwnerRecord>>;
}

/// HTTP client for the indexer
pub struct IndexerClient {
    client: Client,
    base_url: String,
    testnet: bool,
}

impl IndexerClient {
    pub fn new(config: &IndexerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PassportError::Config(format!("indexer client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            testnet: config.testnet,
        })
    }

    async fn fetch<T>(&self, path: FeedPath, query: &[(&str, String)]) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/api/{}", self.base_url, path.as_str());
        let mut params: Vec<(&str, String)> = query.to_vec();
        if self.testnet {
            params.push(("is_testnet", "true".to_string()));
        }

        debug!(url = %url, ?params, "Fetching indexer feed");
        let response = self.client.get(&url).query(&params).send().await?;
        if !response.status().is_success() {
            return Err(PassportError::UpstreamUnavailable(format!(
                "non 200 response for {}: {}",
                path.as_str(),
                response.status().as_u16()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl EventSource for IndexerClient {
    async fn ping(&self) -> Result<()> {
        let url = format!("{}/ping", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PassportError::UpstreamUnavailable(format!(
                "ping returned {}",
                response.status().as_u16()
            )))
        }
    }

    async fn sup_transfers(&self, path: FeedPath, since_block: u64) -> Result<Vec<SupTransferRecord>> {
        self.fetch(path, &[("since_block", since_block.to_string())]).await
    }

    async fn purchases(&self, path: FeedPath, since_block: u64) -> Result<Vec<PurchaseRecord>> {
        self.fetch(path, &[("since_block", since_block.to_string())]).await
    }

    async fn nft_owners(&self, contract: &str) -> Result<Vec<NftOwnerRecord>> {
        self.fetch(
            FeedPath::NftTokens,
            &[("contract_address", contract.to_string()), ("confirmations", "3".to_string())],
        )
        .await
    }
}
