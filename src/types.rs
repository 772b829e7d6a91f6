//! Core types for the passport ledger

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PassportError, Result};

/// Identifier shared by a user/syndicate and its ledger account
pub type AccountId = Uuid;
pub type TransactionId = Uuid;
pub type Timestamp = DateTime<Utc>;

/// Number of decimal places of one SUP in base units
pub const SUPS_DECIMALS: u32 = 18;

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex-encoded SHA256, used as the lookup key for API keys
pub fn sha256_hex(data: &str) -> String {
    hex::encode(sha256(data.as_bytes()))
}

/// First `len` hex characters of `bytes`
pub fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut encoded = hex::encode(bytes);
    encoded.truncate(len);
    encoded
}

/// Wall clock in nanoseconds, used to build unique references
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    User,
    Syndicate,
    System,
}

/// Explicit soft-delete state carried by every mutable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Active,
    Deleted,
}

impl LifecycleState {
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active)
    }
}

/// Ledger account metadata. The balance lives in its own tree and is only
/// written by the balance cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub account_type: AccountType,
    #[serde(default)]
    pub state: LifecycleState,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(id: AccountId, account_type: AccountType) -> Self {
        Self {
            id,
            account_type,
            state: LifecycleState::Active,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

/// Immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: Decimal,
    pub reference: String,
    pub description: String,
    pub group: String,
    pub sub_group: String,
    pub related_transaction_id: Option<TransactionId>,
    /// Originating service, checked by the refund rule
    pub service_id: Option<String>,
    pub status: TxStatus,
    pub created_at: Timestamp,
}

/// Parameters of a single `Transact` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Decimal,
    pub reference: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub sub_group: String,
    #[serde(default)]
    pub related_transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub service_id: Option<String>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Decimal, reference: impl Into<String>) -> Self {
        Self {
            from,
            to,
            amount,
            reference: reference.into(),
            description: String::new(),
            group: String::new(),
            sub_group: String::new(),
            related_transaction_id: None,
            service_id: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn group(mut self, group: impl Into<String>, sub_group: impl Into<String>) -> Self {
        self.group = group.into();
        self.sub_group = sub_group.into();
        self
    }

    pub fn related(mut self, related: TransactionId) -> Self {
        self.related_transaction_id = Some(related);
        self
    }

    pub fn service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }
}

/// Withdrawal held in escrow until the on-chain transfer is observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRefund {
    pub id: Uuid,
    pub user_id: AccountId,
    pub amount: Decimal,
    pub transaction_reference: String,
    pub withdraw_transaction_id: TransactionId,
    /// Deadline after which the hold may be reversed
    pub refunded_at: Timestamp,
    pub tx_hash: Option<String>,
    pub is_refunded: bool,
    pub refund_canceled_at: Option<Timestamp>,
    pub reversal_transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub state: LifecycleState,
    pub created_at: Timestamp,
}

impl PendingRefund {
    /// Still waiting on chain: no tx hash, not canceled, not refunded
    pub fn is_open(&self) -> bool {
        self.state.is_active()
            && self.tx_hash.as_deref().map_or(true, str::is_empty)
            && self.refund_canceled_at.is_none()
            && !self.is_refunded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: AccountId,
    pub username: String,
    pub public_address: Option<String>,
    pub faction_id: Option<Uuid>,
    #[serde(default)]
    pub state: LifecycleState,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syndicate {
    pub id: AccountId,
    pub name: String,
    pub founded_by: AccountId,
    pub faction_id: Option<Uuid>,
    #[serde(default)]
    pub state: LifecycleState,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiKeyType {
    ServerClient,
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_hash: String,
    pub key_type: ApiKeyType,
    /// Service the key authenticates as
    pub service_id: String,
    #[serde(default)]
    pub state: LifecycleState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub slug: String,
    pub mint_contract: String,
    pub stake_contract: Option<String>,
    pub staking_contract_old: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnChainStatus {
    Mintable,
    Stakable,
    Unstakable,
    UnstakableOld,
}

/// Non-fungible item owned by an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAsset {
    pub id: Uuid,
    pub collection_id: Uuid,
    pub token_id: u64,
    pub hash: String,
    pub owner_id: AccountId,
    pub locked_to_service: Option<String>,
    pub on_chain_status: OnChainStatus,
    pub name: String,
    #[serde(default)]
    pub state: LifecycleState,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Append-only ownership change record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetTransferEvent {
    pub id: u64,
    pub asset_id: Uuid,
    pub asset_hash: String,
    pub from_user: AccountId,
    pub to_user: AccountId,
    pub initiated_from: String,
    pub related_transaction_id: Option<TransactionId>,
    pub transferred_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    Confirmed,
}

/// Deposit announced by a user before the indexer has seen it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositTransaction {
    pub tx_hash: String,
    pub user_id: AccountId,
    pub amount: Decimal,
    pub status: DepositStatus,
    pub created_at: Timestamp,
}

/// Well-known system accounts seeded at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAccount {
    XsynTreasury,
    SupremacyGame,
    SupremacyBattle,
    SupremacySupPool,
    Zaibatsu,
    RedMountain,
    BostonCybernetics,
    OnChain,
    XsynSale,
}

impl SystemAccount {
    pub const ALL: [SystemAccount; 9] = [
        SystemAccount::XsynTreasury,
        SystemAccount::SupremacyGame,
        SystemAccount::SupremacyBattle,
        SystemAccount::SupremacySupPool,
        SystemAccount::Zaibatsu,
        SystemAccount::RedMountain,
        SystemAccount::BostonCybernetics,
        SystemAccount::OnChain,
        SystemAccount::XsynSale,
    ];

    pub const FACTIONS: [SystemAccount; 3] = [
        SystemAccount::Zaibatsu,
        SystemAccount::RedMountain,
        SystemAccount::BostonCybernetics,
    ];

    pub fn id(&self) -> AccountId {
        match self {
            SystemAccount::XsynTreasury => Uuid::from_u128(0xebf30ca0_875b_4e84_9a78_0b3fa36a1f87),
            SystemAccount::SupremacyGame => Uuid::from_u128(0x4fae8fdf_584f_46bb_9cb9_bb32ae20177e),
            SystemAccount::SupremacyBattle => Uuid::from_u128(0x87c60803_b051_4abb_aa60_487104946bd7),
            SystemAccount::SupremacySupPool => Uuid::from_u128(0xc579bb47_7efb_4286_a5cc_e5edbb54626d),
            SystemAccount::Zaibatsu => Uuid::from_u128(0x1a657a32_778e_4612_8cc1_14e360665f2b),
            SystemAccount::RedMountain => Uuid::from_u128(0x305da475_53dc_4973_8d78_a30d390d3de5),
            SystemAccount::BostonCybernetics => Uuid::from_u128(0x15f29ee9_e834_4f76_aff8_31e39faabe2d),
            SystemAccount::OnChain => Uuid::from_u128(0x2fa1a63e_a4fa_4618_921f_4b4d28132069),
            SystemAccount::XsynSale => Uuid::from_u128(0x1429a004_84a1_11ec_a8a3_0242ac120002),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemAccount::XsynTreasury => "XsynTreasury",
            SystemAccount::SupremacyGame => "Supremacy",
            SystemAccount::SupremacyBattle => "SupremacyBattleUser",
            SystemAccount::SupremacySupPool => "SupremacySupPoolUser",
            SystemAccount::Zaibatsu => "Zaibatsu",
            SystemAccount::RedMountain => "RedMountain",
            SystemAccount::BostonCybernetics => "BostonCybernetics",
            SystemAccount::OnChain => "OnChain",
            SystemAccount::XsynSale => "XsynSale",
        }
    }

    pub fn from_id(id: &AccountId) -> Option<SystemAccount> {
        Self::ALL.iter().copied().find(|s| s.id() == *id)
    }

    pub fn is_system(id: &AccountId) -> bool {
        Self::from_id(id).is_some()
    }
}

/// Parse a caller-supplied amount and require it to be strictly positive
pub fn parse_positive_amount(raw: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(raw.trim())
        .map_err(|e| PassportError::InvalidAmount(format!("'{}': {}", raw, e)))?;
    if amount <= Decimal::ZERO {
        return Err(PassportError::InvalidAmount(format!("{} must be positive", amount)));
    }
    Ok(amount)
}

fn pow10(exp: u32) -> Result<Decimal> {
    10i128
        .checked_pow(exp)
        .and_then(|p| Decimal::try_from_i128_with_scale(p, 0).ok())
        .ok_or_else(|| PassportError::InvalidAmount(format!("10^{} overflows", exp)))
}

/// Convert an integer token amount with `decimals` places into 18-decimal base units
pub fn rescale_to_base_units(value_int: &str, decimals: u32) -> Result<Decimal> {
    let value = Decimal::from_str(value_int.trim())
        .map_err(|e| PassportError::InvalidAmount(format!("value_int '{}': {}", value_int, e)))?;
    let scaled = if decimals <= SUPS_DECIMALS {
        value.checked_mul(pow10(SUPS_DECIMALS - decimals)?)
    } else {
        value.checked_div(pow10(decimals - SUPS_DECIMALS)?)
    };
    scaled
        .map(|d| d.normalize())
        .ok_or_else(|| PassportError::InvalidAmount(format!("value_int '{}' out of range", value_int)))
}

/// Whole SUPS (possibly fractional) to base units
pub fn sups_to_base_units(sups: &str) -> Result<Decimal> {
    let value = Decimal::from_str(sups.trim())
        .map_err(|e| PassportError::InvalidAmount(format!("sups '{}': {}", sups, e)))?;
    value
        .checked_mul(pow10(SUPS_DECIMALS)?)
        .map(|d| d.trunc().normalize())
        .ok_or_else(|| PassportError::InvalidAmount(format!("sups '{}' out of range", sups)))
}

/// Base units rendered as whole SUPS with four decimals, e.g. `12.5000`
pub fn format_sups(amount: Decimal) -> String {
    let sups = amount
        .checked_div(Decimal::from(1_000_000_000_000_000_000u64))
        .unwrap_or_default();
    format!("{:.4}", sups)
}

/// Lower-cased address used as the lookup key
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
