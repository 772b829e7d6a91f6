//! Persisted watermarks, feature flags and runtime settings

use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

use crate::error::Result;
use crate::store::LedgerStore;

pub const LATEST_DEPOSIT_BLOCK: &str = "latest_deposit_block";
pub const LATEST_DEPOSIT_BLOCK_ETH: &str = "latest_deposit_block_eth";
pub const LATEST_WITHDRAW_BLOCK: &str = "latest_withdraw_block";
pub const LATEST_WITHDRAW_BLOCK_ETH: &str = "latest_withdraw_block_eth";
pub const LATEST_BNB_BLOCK: &str = "latest_bnb_block";
pub const LATEST_BUSD_BLOCK: &str = "latest_busd_block";
pub const LATEST_ETH_BLOCK: &str = "latest_eth_block";
pub const LATEST_USDC_BLOCK: &str = "latest_usdc_block";

pub const ENABLE_WITHDRAW_ROLLBACK: &str = "enable_withdraw_rollback";
pub const AVANT_FAILURE_COUNT: &str = "avant_failure_count";
pub const AVANT_SUCCESS_COUNT: &str = "avant_success_count";

pub const ENABLE_SYNC_PAYMENTS: &str = "enable_sync_payments";
pub const ENABLE_SYNC_DEPOSITS: &str = "enable_sync_deposits";
pub const ENABLE_SYNC_NFT_OWNERS: &str = "enable_sync_nft_owners";
pub const ENABLE_SYNC_WITHDRAW: &str = "enable_sync_withdraw";
pub const ENABLE_BSC_DEPOSITS: &str = "enable_bsc_deposits";
pub const ENABLE_ETH_DEPOSITS: &str = "enable_eth_deposits";
pub const ENABLE_BSC_WITHDRAWS: &str = "enable_bsc_withdraws";
pub const ENABLE_ETH_WITHDRAWS: &str = "enable_eth_withdraws";

pub const CONTRACT_PURCHASE_ADDRESS: &str = "contract_purchase_address";
pub const SYNDICATE_CREATE_FEE: &str = "syndicate_create_fee";
pub const SYNDICATE_CREATE_FEE_CUT: &str = "syndicate_create_fee_cut";

/// Typed view over the `kv` tree.
///
/// Reading a missing key stores the default, so every setting in use shows
/// up in the tree for operators to edit.
#[derive(Clone)]
pub struct KvStore {
    store: LedgerStore,
}

impl KvStore {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    pub fn get_string(&self, key: &str, default: &str) -> Result<String> {
        match self.store.kv_get(key)? {
            Some(value) => Ok(value),
            None => {
                self.put_string(key, default)?;
                Ok(default.to_string())
            }
        }
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.store.kv_put(key, value)
    }

    /// Unparseable values fall back to the default and are logged
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.store.kv_get(key)? {
            Some(raw) => Ok(raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, "Invalid integer in kv store, using default");
                default
            })),
            None => {
                self.put_u64(key, default)?;
                Ok(default)
            }
        }
    }

    pub fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        self.store.kv_put(key, &value.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.store.kv_get(key)? {
            Some(raw) => Ok(match raw.trim().to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    warn!(key, value = %raw, "Invalid flag in kv store, using default");
                    default
                }
            }),
            None => {
                self.put_bool(key, default)?;
                Ok(default)
            }
        }
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.store.kv_put(key, if value { "true" } else { "false" })
    }

    pub fn get_decimal(&self, key: &str, default: Decimal) -> Result<Decimal> {
        match self.store.kv_get(key)? {
            Some(raw) => Ok(Decimal::from_str(raw.trim()).unwrap_or_else(|_| {
                warn!(key, value = %raw, "Invalid decimal in kv store, using default");
                default
            })),
            None => {
                self.put_decimal(key, default)?;
                Ok(default)
            }
        }
    }

    pub fn put_decimal(&self, key: &str, value: Decimal) -> Result<()> {
        self.store.kv_put(key, &value.to_string())
    }
}
