//! Withdrawal escrow
//!
//! A withdrawal debits the user into the ON_CHAIN account right away and
//! records a [`PendingRefund`]. The hold is confirmed once the matching
//! on-chain transfer shows up in the indexer feed, or reversed after its
//! deadline passes with nothing observed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{PassportError, Result};
use crate::events::LedgerEvent;
use crate::indexer::SupTransferRecord;
use crate::store::LedgerStore;
use crate::transactor::Transactor;
use crate::types::{
    format_sups, normalize_address, now_nanos, rescale_to_base_units, AccountId, LifecycleState,
    PendingRefund, SystemAccount, Timestamp, TransferRequest,
};

pub const GROUP_WITHDRAWAL: &str = "WITHDRAWAL";

/// Counters of a reversal pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReversalReport {
    pub reversed: usize,
    pub skipped: usize,
    pub dry_run: bool,
}

/// Durable escrow rows. A trait so holds can be exercised against a store
/// that fails on demand.
pub trait HoldStore: Send + Sync {
    fn put_pending_refund(&self, refund: &PendingRefund) -> Result<()>;

    fn list_pending_refunds(&self) -> Result<Vec<PendingRefund>>;
}

impl HoldStore for LedgerStore {
    fn put_pending_refund(&self, refund: &PendingRefund) -> Result<()> {
        LedgerStore::put_pending_refund(self, refund)
    }

    fn list_pending_refunds(&self) -> Result<Vec<PendingRefund>> {
        LedgerStore::list_pending_refunds(self)
    }
}

pub struct Escrow {
    transactor: Arc<Transactor>,
    holds: Arc<dyn HoldStore>,
    expiry: Duration,
    grace: Duration,
    // Serializes read-modify-write of refund rows
    rows: Mutex<()>,
}

impl Escrow {
    pub fn new(transactor: Arc<Transactor>, sync: &SyncConfig) -> Self {
        let holds = Arc::new(transactor.store().clone());
        Self::with_hold_store(transactor, holds, sync)
    }

    pub fn with_hold_store(transactor: Arc<Transactor>, holds: Arc<dyn HoldStore>, sync: &SyncConfig) -> Self {
        Self {
            transactor,
            holds,
            expiry: Duration::seconds(sync.withdraw_expiry_secs),
            grace: Duration::seconds(sync.refund_grace_secs),
            rows: Mutex::new(()),
        }
    }

    /// Debit `amount` from `user` and hold it until the withdrawal is seen on
    /// chain. The hold may be reversed after signature expiry plus grace.
    pub fn hold_withdrawal(&self, user: &AccountId, amount: Decimal) -> Result<PendingRefund> {
        if SystemAccount::is_system(user) {
            return Err(PassportError::Forbidden("system accounts cannot withdraw".into()));
        }
        let reference = format!("{}|{}", Uuid::new_v4(), now_nanos());
        let request = TransferRequest::new(*user, SystemAccount::OnChain.id(), amount, reference.clone())
            .description(format!("Withdraw of {} SUPS", format_sups(amount)))
            .group(GROUP_WITHDRAWAL, "");
        let withdraw_tx = self.transactor.transact(request)?;

        let now = Utc::now();
        let hold = PendingRefund {
            id: Uuid::new_v4(),
            user_id: *user,
            amount,
            transaction_reference: reference,
            withdraw_transaction_id: withdraw_tx,
            refunded_at: now + self.expiry + self.grace,
            tx_hash: None,
            is_refunded: false,
            refund_canceled_at: None,
            reversal_transaction_id: None,
            state: LifecycleState::Active,
            created_at: now,
        };
        if let Err(e) = self.holds.put_pending_refund(&hold) {
            error!(user_id = %user, amount = %amount, error = %e, "Failed to record withdrawal hold, returning funds");
            self.release_unrecorded_hold(&hold);
            return Err(e);
        }
        info!(
            refund_id = %hold.id,
            user_id = %user,
            amount = %amount,
            deadline = %hold.refunded_at,
            "Withdrawal held in escrow"
        );
        Ok(hold)
    }

    /// Credit back a withdraw debit whose hold row was never written
    fn release_unrecorded_hold(&self, hold: &PendingRefund) {
        let request = TransferRequest::new(
            SystemAccount::OnChain.id(),
            hold.user_id,
            hold.amount,
            format!("REFUND {}", hold.transaction_reference),
        )
        .description("REFUND unrecorded withdraw")
        .group(GROUP_WITHDRAWAL, "")
        .related(hold.withdraw_transaction_id);
        if let Err(e) = self.transactor.transact(request) {
            error!(
                user_id = %hold.user_id,
                withdraw_transaction_id = %hold.withdraw_transaction_id,
                error = %e,
                "Failed to return funds of unrecorded withdrawal"
            );
        }
    }

    pub fn list_for_user(&self, user: &AccountId) -> Result<Vec<PendingRefund>> {
        let mut rows: Vec<_> = self
            .holds
            .list_pending_refunds()?
            .into_iter()
            .filter(|r| r.user_id == *user && r.state.is_active())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    /// Confirm holds against observed on-chain withdrawals.
    ///
    /// Each record confirms the oldest open hold of the receiving user with
    /// the same amount. A tx hash already attached to a hold is never reused.
    ///
    /// # Returns
    /// `(success, skipped)`
    pub fn attach_tx_hash(&self, records: &[SupTransferRecord]) -> Result<(usize, usize)> {
        let _rows = self.rows.lock();
        let store = self.transactor.store();
        let mut holds = self.holds.list_pending_refunds()?;
        let mut attached: HashSet<String> = holds
            .iter()
            .filter_map(|r| r.tx_hash.clone())
            .filter(|h| !h.is_empty())
            .map(|h| h.to_lowercase())
            .collect();
        holds.sort_by_key(|r| r.created_at);

        let mut success = 0;
        let mut skipped = 0;
        for record in records {
            let tx_hash = record.tx_hash.to_lowercase();
            if attached.contains(&tx_hash) {
                skipped += 1;
                continue;
            }
            let amount = match rescale_to_base_units(&record.value_int, record.value_decimals) {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(tx_hash = %record.tx_hash, user_addr = %record.to_address, error = %e, "Convert to decimal failed");
                    skipped += 1;
                    continue;
                }
            };
            let user = store
                .get_user_by_address(&normalize_address(&record.to_address))?
                .filter(|u| u.state.is_active());
            let Some(user) = user else {
                skipped += 1;
                continue;
            };

            let Some(hold) = holds
                .iter_mut()
                .find(|r| r.user_id == user.id && r.amount == amount && r.is_open())
            else {
                skipped += 1;
                continue;
            };

            hold.tx_hash = Some(tx_hash.clone());
            hold.refund_canceled_at = Some(Utc::now());
            if let Err(e) = self.holds.put_pending_refund(hold) {
                warn!(refund_id = %hold.id, tx_hash = %tx_hash, error = %e, "Failed to attach tx hash to pending refund");
                hold.tx_hash = None;
                hold.refund_canceled_at = None;
                skipped += 1;
                continue;
            }
            info!(refund_id = %hold.id, user_id = %user.id, tx_hash = %tx_hash, "Withdrawal confirmed on chain");
            attached.insert(tx_hash);
            success += 1;
        }
        Ok((success, skipped))
    }

    /// Credit back holds whose deadline passed before `now` with no on-chain
    /// transfer observed. With `enabled` false nothing is mutated and the
    /// candidates are only logged.
    pub fn reverse_expired(&self, now: Timestamp, enabled: bool) -> Result<ReversalReport> {
        let _rows = self.rows.lock();
        let store = self.transactor.store();
        let mut report = ReversalReport {
            dry_run: !enabled,
            ..Default::default()
        };

        let mut expired: Vec<PendingRefund> = self
            .holds
            .list_pending_refunds()?
            .into_iter()
            .filter(|r| r.is_open() && r.refunded_at < now)
            .collect();
        expired.sort_by_key(|r| r.created_at);

        for mut refund in expired {
            let withdraw = match store.get_transaction(&refund.withdraw_transaction_id)? {
                Some(tx) => tx,
                None => {
                    warn!(refund_id = %refund.id, "Withdraw transaction missing, cannot reverse");
                    report.skipped += 1;
                    continue;
                }
            };

            let request = TransferRequest::new(
                SystemAccount::OnChain.id(),
                withdraw.from_account,
                withdraw.amount,
                format!("REFUND {}", withdraw.reference),
            )
            .description(format!("REFUND {}", withdraw.description))
            .group(withdraw.group.clone(), withdraw.sub_group.clone())
            .related(withdraw.id);

            if !enabled {
                info!(
                    refund_id = %refund.id,
                    user_id = %refund.user_id,
                    amount = %format_sups(refund.amount),
                    reference = %request.reference,
                    "Reversed withdraw (dry run)"
                );
                report.reversed += 1;
                continue;
            }

            // A crash after the credit replays the same reference on the next
            // pass and only then marks the row
            let reversal_id = match self.transactor.transact(request) {
                Ok(id) => id,
                Err(e) => {
                    warn!(refund_id = %refund.id, error = %e, "Failed to reverse withdraw");
                    report.skipped += 1;
                    continue;
                }
            };

            refund.is_refunded = true;
            refund.refund_canceled_at = Some(Utc::now());
            refund.reversal_transaction_id = Some(reversal_id);
            if let Err(e) = self.holds.put_pending_refund(&refund) {
                warn!(refund_id = %refund.id, error = %e, "Failed to mark pending refund reversed");
                report.skipped += 1;
                continue;
            }

            info!(
                refund_id = %refund.id,
                user_id = %refund.user_id,
                amount = %format_sups(refund.amount),
                reversal_transaction_id = %reversal_id,
                "Reversed withdraw"
            );
            self.transactor.events().publish(&LedgerEvent::WithdrawalReversed {
                refund,
                transaction_id: reversal_id,
            });
            report.reversed += 1;
        }

        Ok(report)
    }
}
