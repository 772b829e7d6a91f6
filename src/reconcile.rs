//! Reconciliation of on-chain deposits, purchases and withdrawals
//!
//! Each feed keeps a persisted block watermark. A run fetches everything
//! above the watermark, applies each record exactly once through the
//! transactor (the tx hash is the transaction reference), and persists the
//! new watermark when the batch is done. The watermark never moves past a
//! block holding a failed record, so failures are fetched again next run.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountDirectory;
use crate::error::{PassportError, Result};
use crate::escrow::{Escrow, ReversalReport};
use crate::health::IndexerHealth;
use crate::indexer::{EventSource, FeedPath, PurchaseRecord, SupTransferRecord};
use crate::kv::{self, KvStore};
use crate::transactor::Transactor;
use crate::types::{
    format_sups, rescale_to_base_units, sups_to_base_units, AccountId, DepositStatus,
    DepositTransaction, SystemAccount, TransferRequest,
};

pub const GROUP_DEPOSIT: &str = "DEPOSIT";
pub const GROUP_STORE: &str = "STORE";

/// A watermarked indexer feed
#[derive(Debug, Clone, Copy)]
struct Feed {
    path: FeedPath,
    watermark_key: &'static str,
    enable_key: Option<(&'static str, bool)>,
}

const DEPOSIT_FEEDS: [Feed; 2] = [
    Feed {
        path: FeedPath::SupsDepositBsc,
        watermark_key: kv::LATEST_DEPOSIT_BLOCK,
        enable_key: Some((kv::ENABLE_BSC_DEPOSITS, true)),
    },
    Feed {
        path: FeedPath::SupsDepositEth,
        watermark_key: kv::LATEST_DEPOSIT_BLOCK_ETH,
        enable_key: Some((kv::ENABLE_ETH_DEPOSITS, false)),
    },
];

const WITHDRAW_FEEDS: [Feed; 2] = [
    Feed {
        path: FeedPath::SupsWithdrawBsc,
        watermark_key: kv::LATEST_WITHDRAW_BLOCK,
        enable_key: Some((kv::ENABLE_BSC_WITHDRAWS, true)),
    },
    Feed {
        path: FeedPath::SupsWithdrawEth,
        watermark_key: kv::LATEST_WITHDRAW_BLOCK_ETH,
        enable_key: Some((kv::ENABLE_ETH_WITHDRAWS, false)),
    },
];

const PURCHASE_FEEDS: [Feed; 4] = [
    Feed { path: FeedPath::BnbPurchases, watermark_key: kv::LATEST_BNB_BLOCK, enable_key: None },
    Feed { path: FeedPath::BusdPurchases, watermark_key: kv::LATEST_BUSD_BLOCK, enable_key: None },
    Feed { path: FeedPath::EthPurchases, watermark_key: kv::LATEST_ETH_BLOCK, enable_key: None },
    Feed { path: FeedPath::UsdcPurchases, watermark_key: kv::LATEST_USDC_BLOCK, enable_key: None },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Skipped,
    Failed,
}

/// Per-run counters
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct WithdrawSyncReport {
    pub attached: usize,
    pub unmatched: usize,
    pub reversal: ReversalReport,
}

/// Highest block reachable from `current` without passing a failed record
fn advance_watermark(current: u64, outcomes: &[(u64, Outcome)]) -> u64 {
    let first_failed = outcomes
        .iter()
        .filter(|(_, o)| *o == Outcome::Failed)
        .map(|(block, _)| *block)
        .min();
    outcomes
        .iter()
        .map(|(block, _)| *block)
        .filter(|block| first_failed.map_or(true, |failed| *block < failed))
        .fold(current, u64::max)
}

pub struct Reconciler {
    source: Arc<dyn EventSource>,
    transactor: Arc<Transactor>,
    accounts: Arc<AccountDirectory>,
    escrow: Arc<Escrow>,
    health: Arc<IndexerHealth>,
    kv: KvStore,
    default_purchase_contract: String,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn EventSource>,
        transactor: Arc<Transactor>,
        accounts: Arc<AccountDirectory>,
        escrow: Arc<Escrow>,
        health: Arc<IndexerHealth>,
        kv: KvStore,
        default_purchase_contract: String,
    ) -> Self {
        Self {
            source,
            transactor,
            accounts,
            escrow,
            health,
            kv,
            default_purchase_contract,
        }
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    pub fn health(&self) -> &Arc<IndexerHealth> {
        &self.health
    }

    pub async fn ping(&self) -> Result<()> {
        self.health.observe(self.source.ping().await)
    }

    fn feed_enabled(&self, feed: &Feed) -> Result<bool> {
        match feed.enable_key {
            Some((key, default)) => self.kv.get_bool(key, default),
            None => Ok(true),
        }
    }

    async fn fetch_transfers(&self, feed: &Feed) -> Result<(u64, Vec<SupTransferRecord>)> {
        let watermark = self.kv.get_u64(feed.watermark_key, 0)?;
        let mut records = self
            .health
            .observe(self.source.sup_transfers(feed.path, watermark).await)?;
        records.retain(|r| r.block_number > watermark);
        records.sort_by_key(|r| (r.block_number, r.log_index));
        Ok((watermark, records))
    }

    fn store_watermark(&self, feed: &Feed, current: u64, outcomes: &[(u64, Outcome)]) -> Result<()> {
        let next = advance_watermark(current, outcomes);
        if next != current {
            self.kv.put_u64(feed.watermark_key, next)?;
            debug!(feed = feed.path.as_str(), from = current, to = next, "Advanced watermark");
        }
        Ok(())
    }

    /// Credit on-chain deposits to their senders.
    ///
    /// # Errors
    /// `UpstreamUnavailable` if the indexer cannot be reached; the run is
    /// abandoned and watermarks of feeds not yet processed stay put.
    pub async fn sync_deposits(&self) -> Result<SyncReport> {
        let purchase_contract = self
            .kv
            .get_string(kv::CONTRACT_PURCHASE_ADDRESS, &self.default_purchase_contract)?;
        let mut report = SyncReport::default();

        for feed in DEPOSIT_FEEDS.iter() {
            if !self.feed_enabled(feed)? {
                continue;
            }
            let (watermark, records) = self.fetch_transfers(feed).await?;
            let mut outcomes = Vec::with_capacity(records.len());
            for record in &records {
                let outcome = self.apply_deposit(record, &purchase_contract);
                report.count(outcome);
                outcomes.push((record.block_number, outcome));
            }
            self.store_watermark(feed, watermark, &outcomes)?;
        }

        info!(success = report.success, skipped = report.skipped, failed = report.failed, "Synced deposits");
        Ok(report)
    }

    fn apply_deposit(&self, record: &SupTransferRecord, purchase_contract: &str) -> Outcome {
        if record.from_address.eq_ignore_ascii_case(purchase_contract) {
            return Outcome::Skipped;
        }
        match self.transactor.store().reference_exists(&record.tx_hash) {
            Ok(true) => return Outcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                error!(tx_hash = %record.tx_hash, error = %e, "Check deposit reference");
                return Outcome::Failed;
            }
        }

        let amount = match rescale_to_base_units(&record.value_int, record.value_decimals) {
            Ok(amount) if amount > Decimal::ZERO => amount,
            Ok(_) => return Outcome::Skipped,
            Err(e) => {
                warn!(tx_hash = %record.tx_hash, error = %e, "Unreadable deposit value");
                return Outcome::Skipped;
            }
        };

        let user = match self.accounts.create_or_get_user_by_address(&record.from_address) {
            Ok(user) => user,
            Err(PassportError::NotFound(_)) => {
                warn!(tx_hash = %record.tx_hash, user_addr = %record.from_address, "Deposit from a deleted user");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(tx_hash = %record.tx_hash, user_addr = %record.from_address, error = %e, "Create or get user");
                return Outcome::Failed;
            }
        };

        let request = TransferRequest::new(SystemAccount::OnChain.id(), user.id, amount, record.tx_hash.clone())
            .description(format!("deposited {} SUPS", format_sups(amount)))
            .group(GROUP_DEPOSIT, "");
        if let Err(e) = self.transactor.transact(request) {
            error!(tx_hash = %record.tx_hash, user_id = %user.id, amount = %amount, error = %e, "Failed to create tx entry for deposit");
            return Outcome::Failed;
        }

        if let Err(e) = self.confirm_deposit(&record.tx_hash) {
            warn!(tx_hash = %record.tx_hash, error = %e, "Failed to confirm registered deposit");
        }
        Outcome::Success
    }

    fn confirm_deposit(&self, tx_hash: &str) -> Result<()> {
        let store = self.transactor.store();
        if let Some(mut deposit) = store.get_deposit_transaction(tx_hash)? {
            if deposit.status == DepositStatus::Pending {
                deposit.status = DepositStatus::Confirmed;
                store.put_deposit_transaction(&deposit)?;
                info!(tx_hash, user_id = %deposit.user_id, "Registered deposit confirmed");
            }
        }
        Ok(())
    }

    /// Record a deposit the user announced before the indexer has seen it
    pub fn register_pending_deposit(
        &self,
        user_id: &AccountId,
        tx_hash: &str,
        amount: Decimal,
    ) -> Result<DepositTransaction> {
        let tx_hash = tx_hash.trim();
        if tx_hash.is_empty() {
            return Err(PassportError::InvalidInput("tx hash must not be empty".into()));
        }
        let store = self.transactor.store();
        if store.get_deposit_transaction(tx_hash)?.is_some() {
            return Err(PassportError::Conflict(format!("deposit {} already registered", tx_hash)));
        }
        let status = if store.reference_exists(tx_hash)? {
            DepositStatus::Confirmed
        } else {
            DepositStatus::Pending
        };
        let deposit = DepositTransaction {
            tx_hash: tx_hash.to_lowercase(),
            user_id: *user_id,
            amount,
            status,
            created_at: Utc::now(),
        };
        store.put_deposit_transaction(&deposit)?;
        Ok(deposit)
    }

    /// Credit SUPS purchases from the sale account
    pub async fn sync_purchases(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for feed in PURCHASE_FEEDS.iter() {
            let watermark = self.kv.get_u64(feed.watermark_key, 0)?;
            let mut records = self
                .health
                .observe(self.source.purchases(feed.path, watermark).await)?;
            records.retain(|r| r.block_number > watermark);
            records.sort_by_key(|r| r.block_number);

            let mut outcomes = Vec::with_capacity(records.len());
            for record in &records {
                let outcome = self.apply_purchase(record);
                report.count(outcome);
                outcomes.push((record.block_number, outcome));
            }
            self.store_watermark(feed, watermark, &outcomes)?;
        }

        info!(success = report.success, skipped = report.skipped, failed = report.failed, "Synced payments");
        Ok(report)
    }

    fn apply_purchase(&self, record: &PurchaseRecord) -> Outcome {
        match self.transactor.store().reference_exists(&record.tx_hash) {
            Ok(true) => return Outcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                error!(sym = %record.symbol, tx_hash = %record.tx_hash, error = %e, "Check record exists");
                return Outcome::Failed;
            }
        }

        let input = match rescale_to_base_units(&record.value_int, record.value_decimals) {
            Ok(input) => input,
            Err(e) => {
                warn!(sym = %record.symbol, tx_hash = %record.tx_hash, error = %e, "Unreadable payment value");
                return Outcome::Skipped;
            }
        };
        if input.is_zero() {
            warn!(sym = %record.symbol, tx_hash = %record.tx_hash, "Zero value payment");
            return Outcome::Skipped;
        }
        let output = match sups_to_base_units(&record.sups) {
            Ok(output) if output > Decimal::ZERO => output,
            _ => {
                warn!(sym = %record.symbol, tx_hash = %record.tx_hash, sups = %record.sups, "Payment without SUPS output");
                return Outcome::Skipped;
            }
        };

        let user = match self.accounts.create_or_get_user_by_address(&record.from_address) {
            Ok(user) => user,
            Err(PassportError::NotFound(_)) => {
                warn!(sym = %record.symbol, tx_hash = %record.tx_hash, "Payment from a deleted user");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(sym = %record.symbol, tx_hash = %record.tx_hash, error = %e, "Create new user for payment insertion");
                return Outcome::Failed;
            }
        };

        let description = format!(
            "purchased {} SUPS for {} [{}]",
            format_sups(output),
            format_sups(input),
            record.symbol.to_uppercase()
        );
        let request = TransferRequest::new(SystemAccount::XsynSale.id(), user.id, output, record.tx_hash.clone())
            .description(description)
            .group(GROUP_STORE, "");
        match self.transactor.transact(request) {
            Ok(_) => Outcome::Success,
            Err(e) => {
                error!(sym = %record.symbol, tx_hash = %record.tx_hash, error = %e, "Failed to store payment record");
                Outcome::Failed
            }
        }
    }

    /// Confirm escrowed withdrawals seen on chain, then reverse the expired
    /// ones if the rollback breaker allows it.
    pub async fn sync_withdrawals(&self) -> Result<WithdrawSyncReport> {
        let mut report = WithdrawSyncReport::default();
        for feed in WITHDRAW_FEEDS.iter() {
            if !self.feed_enabled(feed)? {
                continue;
            }
            let (watermark, records) = self.fetch_transfers(feed).await?;
            let (attached, unmatched) = self.escrow.attach_tx_hash(&records)?;
            report.attached += attached;
            report.unmatched += unmatched;

            let outcomes: Vec<_> = records.iter().map(|r| (r.block_number, Outcome::Success)).collect();
            self.store_watermark(feed, watermark, &outcomes)?;
        }
        info!(success = report.attached, skipped = report.unmatched, "Add tx hashes to pending refunds");

        let rollback_enabled = self.health.rollback_enabled()?;
        report.reversal = self.escrow.reverse_expired(Utc::now(), rollback_enabled)?;
        info!(
            success = report.reversal.reversed,
            skipped = report.reversal.skipped,
            dry_run = report.reversal.dry_run,
            "Refunds processed"
        );
        Ok(report)
    }
}
