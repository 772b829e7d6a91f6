//! Transactor: atomic, idempotent two-account transfers
//!
//! A transfer first claims its reference by writing a PENDING row. Both
//! accounts are then locked in id order, the sender is debited and the
//! receiver credited through the balance cache, and the row is marked
//! SUCCESS. Any failure after the debit is compensated before the error is
//! returned, so a partially applied transfer is never visible.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::balance_cache::{AccountGuard, BalanceCache};
use crate::error::{PassportError, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::store::{BalanceStore, LedgerStore, Reservation};
use crate::types::{AccountId, Transaction, TransactionId, TransferRequest, TxStatus};

/// Outcome of resolving rows left PENDING by a crash
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    pub completed: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub ambiguous: Vec<TransactionId>,
}

/// Account whose stored balance disagrees with the replayed ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceMismatch {
    pub account: AccountId,
    pub stored: Decimal,
    pub replayed: Decimal,
}

pub struct Transactor {
    store: LedgerStore,
    cache: Arc<BalanceCache>,
    events: EventBus,
}

impl Transactor {
    pub fn new(store: LedgerStore, cache: Arc<BalanceCache>, events: EventBus) -> Self {
        Self { store, cache, events }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<BalanceCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current balance of an account
    pub fn balance(&self, account: &AccountId) -> Result<Decimal> {
        self.cache.get(account)
    }

    /// Move `amount` from `req.from` to `req.to`.
    ///
    /// # Returns
    /// The id of the committed transaction. A reference that already belongs
    /// to a committed transaction returns that transaction's id without
    /// moving funds again.
    ///
    /// # Errors
    /// * `InvalidAmount` if the amount is not positive
    /// * `InsufficientFunds` if the sender cannot cover the debit
    /// * `Conflict` if another call holding the same reference is in flight
    /// * `StorageFault` if a durable write failed (all effects compensated)
    pub fn transact(&self, req: TransferRequest) -> Result<TransactionId> {
        if req.amount <= Decimal::ZERO {
            return Err(PassportError::InvalidAmount(format!("{} must be positive", req.amount)));
        }
        if req.reference.trim().is_empty() {
            return Err(PassportError::InvalidInput("reference must not be empty".into()));
        }
        if req.from == req.to {
            return Err(PassportError::InvalidInput("cannot transfer to the same account".into()));
        }

        let row = Transaction {
            id: Uuid::new_v4(),
            from_account: req.from,
            to_account: req.to,
            amount: req.amount,
            reference: req.reference,
            description: req.description,
            group: req.group,
            sub_group: req.sub_group,
            related_transaction_id: req.related_transaction_id,
            service_id: req.service_id,
            status: TxStatus::Pending,
            created_at: Utc::now(),
        };

        match self.store.reserve_transaction(&row)? {
            Reservation::Existing(existing) if existing.status == TxStatus::Success => {
                debug!(reference = %existing.reference, transaction_id = %existing.id, "Reference already applied");
                return Ok(existing.id);
            }
            Reservation::Existing(existing) => {
                return Err(PassportError::Conflict(format!(
                    "transaction with reference '{}' is already in progress",
                    existing.reference
                )));
            }
            Reservation::Reserved => {}
        }

        match self.apply(&row) {
            Ok((from_balance, to_balance)) => {
                info!(
                    transaction_id = %row.id,
                    from = %row.from_account,
                    to = %row.to_account,
                    amount = %row.amount,
                    reference = %row.reference,
                    group = %row.group,
                    sub_group = %row.sub_group,
                    "Transaction committed"
                );
                let mut committed = row;
                committed.status = TxStatus::Success;
                let id = committed.id;
                self.events.publish(&LedgerEvent::TransactionCommitted {
                    transaction: committed,
                    from_balance,
                    to_balance,
                });
                Ok(id)
            }
            Err(e) => {
                if let Err(mark_err) = self.store.set_transaction_status(&row.id, TxStatus::Failed) {
                    // Left PENDING; startup recovery resolves it
                    error!(transaction_id = %row.id, error = %mark_err, "Failed to mark transaction FAILED");
                }
                if e.is_permanent() {
                    debug!(reference = %row.reference, error = %e, "Transaction rejected");
                } else {
                    warn!(
                        transaction_id = %row.id,
                        from = %row.from_account,
                        to = %row.to_account,
                        amount = %row.amount,
                        reference = %row.reference,
                        error = %e,
                        "Transaction failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Debit, credit and commit under both account locks
    fn apply(&self, row: &Transaction) -> Result<(Decimal, Decimal)> {
        let from_slot = self.cache.slot(&row.from_account);
        let to_slot = self.cache.slot(&row.to_account);

        // Lock in id order so opposing transfers cannot deadlock
        let (mut from_guard, mut to_guard) = if row.from_account < row.to_account {
            let from_guard = self.cache.lock(&row.from_account, &from_slot);
            let to_guard = self.cache.lock(&row.to_account, &to_slot);
            (from_guard, to_guard)
        } else {
            let to_guard = self.cache.lock(&row.to_account, &to_slot);
            let from_guard = self.cache.lock(&row.from_account, &from_slot);
            (from_guard, to_guard)
        };

        // Make sure the receiver exists before touching the sender
        to_guard.balance()?;

        let from_balance = from_guard.apply_delta(-row.amount)?;

        let to_balance = match to_guard.apply_delta(row.amount) {
            Ok(balance) => balance,
            Err(e) => {
                Self::compensate(&mut from_guard, row.amount, row);
                return Err(e);
            }
        };

        if let Err(e) = self.store.set_transaction_status(&row.id, TxStatus::Success) {
            Self::compensate(&mut to_guard, -row.amount, row);
            Self::compensate(&mut from_guard, row.amount, row);
            return Err(PassportError::StorageFault(format!(
                "failed to commit transaction {}: {}",
                row.id, e
            )));
        }

        Ok((from_balance, to_balance))
    }

    fn compensate(guard: &mut AccountGuard<'_>, delta: Decimal, row: &Transaction) {
        match guard.apply_delta(delta) {
            Ok(balance) => {
                warn!(account = %guard.id(), %delta, %balance, transaction_id = %row.id, "Compensated partial transfer");
            }
            Err(e) => {
                error!(
                    account = %guard.id(),
                    %delta,
                    transaction_id = %row.id,
                    reference = %row.reference,
                    error = %e,
                    "Compensation failed, balance needs operator attention"
                );
            }
        }
    }

    /// Reverse a committed transaction.
    ///
    /// The refund moves the same amount back, carries the reference
    /// `"REFUND - {original reference}"` and links to the original through
    /// `related_transaction_id`. A transaction can be refunded at most once.
    pub fn refund(&self, original_id: &TransactionId, caller_service: Option<&str>) -> Result<TransactionId> {
        let original = self
            .store
            .get_transaction(original_id)?
            .ok_or_else(|| PassportError::NotFound(format!("transaction {}", original_id)))?;

        if original.status != TxStatus::Success {
            return Err(PassportError::Conflict(format!("transaction {} is not committed", original_id)));
        }
        if original.related_transaction_id.is_some() {
            return Err(PassportError::Conflict("a refund cannot be refunded".into()));
        }
        if self.store.refund_of(original_id)?.is_some() {
            return Err(PassportError::Conflict(format!("transaction {} already refunded", original_id)));
        }
        if let Some(caller) = caller_service {
            if original.service_id.as_deref() != Some(caller) {
                return Err(PassportError::Forbidden(
                    "only the originating service can refund a transaction".into(),
                ));
            }
        }

        let mut req = TransferRequest::new(
            original.to_account,
            original.from_account,
            original.amount,
            format!("REFUND - {}", original.reference),
        )
        .description(format!("Reverse transaction - {}", original.description))
        .group(original.group.clone(), original.sub_group.clone())
        .related(original.id);
        req.service_id = original.service_id.clone();

        let refund_id = self.transact(req)?;

        if !self.store.link_refund(original_id, &refund_id)? && self.store.refund_of(original_id)? != Some(refund_id) {
            return Err(PassportError::Conflict(format!("transaction {} already refunded", original_id)));
        }
        info!(original = %original_id, refund = %refund_id, "Transaction refunded");
        Ok(refund_id)
    }

    /// Resolve rows left PENDING by a crash. Call before serving traffic.
    ///
    /// Each row is compared against the balances implied by committed rows:
    /// both legs applied marks it SUCCESS, only the debit applied compensates
    /// the debit and marks it FAILED, nothing applied marks it FAILED. Rows
    /// that share an account with another pending row cannot be told apart
    /// and are left for an operator.
    pub fn recover_pending(&self) -> Result<RecoveryReport> {
        let pending = self.store.list_transactions_with_status(TxStatus::Pending)?;
        let mut report = RecoveryReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let replayed = self.store.replay_balances()?;
        let mut involvement: HashMap<AccountId, usize> = HashMap::new();
        for tx in &pending {
            *involvement.entry(tx.from_account).or_default() += 1;
            *involvement.entry(tx.to_account).or_default() += 1;
        }

        for tx in pending {
            if involvement[&tx.from_account] > 1 || involvement[&tx.to_account] > 1 {
                error!(transaction_id = %tx.id, reference = %tx.reference, "Pending transaction shares accounts with another, leaving for operator");
                report.ambiguous.push(tx.id);
                continue;
            }

            let expected_from = replayed.get(&tx.from_account).copied().unwrap_or_default();
            let expected_to = replayed.get(&tx.to_account).copied().unwrap_or_default();
            let stored_from = self.cache.get(&tx.from_account)?;
            let stored_to = self.cache.get(&tx.to_account)?;

            let debited = stored_from == expected_from - tx.amount;
            let credited = stored_to == expected_to + tx.amount;
            let from_untouched = stored_from == expected_from;
            let to_untouched = stored_to == expected_to;

            if debited && credited {
                self.store.set_transaction_status(&tx.id, TxStatus::Success)?;
                info!(transaction_id = %tx.id, "Recovered pending transaction as committed");
                report.completed += 1;
            } else if debited && to_untouched {
                self.cache.apply_delta(&tx.from_account, tx.amount)?;
                self.store.set_transaction_status(&tx.id, TxStatus::Failed)?;
                warn!(transaction_id = %tx.id, account = %tx.from_account, amount = %tx.amount, "Rolled back half-applied transaction");
                report.rolled_back += 1;
            } else if from_untouched && to_untouched {
                self.store.set_transaction_status(&tx.id, TxStatus::Failed)?;
                info!(transaction_id = %tx.id, "Pending transaction never applied, marked failed");
                report.failed += 1;
            } else {
                error!(
                    transaction_id = %tx.id,
                    %stored_from,
                    %expected_from,
                    %stored_to,
                    %expected_to,
                    "Pending transaction does not match ledger, leaving for operator"
                );
                report.ambiguous.push(tx.id);
            }
        }

        info!(
            completed = report.completed,
            rolled_back = report.rolled_back,
            failed = report.failed,
            ambiguous = report.ambiguous.len(),
            "Pending transaction recovery finished"
        );
        Ok(report)
    }

    /// Load every account balance into the cache
    pub fn warm_cache(&self) -> Result<usize> {
        let accounts = self.store.list_accounts()?;
        for account in &accounts {
            self.cache.get(&account.id)?;
        }
        info!(accounts = accounts.len(), cached = self.cache.cached_accounts(), "Balance cache warmed");
        Ok(accounts.len())
    }

    /// Accounts whose stored balance differs from the sum of committed rows
    pub fn audit(&self) -> Result<Vec<BalanceMismatch>> {
        let replayed = self.store.replay_balances()?;
        let mut mismatches = Vec::new();
        for account in self.store.list_accounts()? {
            let stored = self.store.load_balance(&account.id)?.unwrap_or_default();
            let expected = replayed.get(&account.id).copied().unwrap_or_default();
            if stored != expected {
                mismatches.push(BalanceMismatch {
                    account: account.id,
                    stored,
                    replayed: expected,
                });
            }
        }
        if !mismatches.is_empty() {
            warn!(count = mismatches.len(), "Ledger audit found balance mismatches");
        }
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance_cache::tests::FlakyStore;
    use crate::types::{Account, AccountType, SystemAccount};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Transactor) {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.create_account(&Account::new(SystemAccount::OnChain.id(), AccountType::System)).unwrap();
        let cache = Arc::new(BalanceCache::new(
            Arc::new(store.clone()),
            HashSet::from([SystemAccount::OnChain.id()]),
        ));
        (dir, Transactor::new(store, cache, EventBus::new()))
    }

    fn user(transactor: &Transactor, funds: i64) -> AccountId {
        let id = Uuid::new_v4();
        transactor.store().create_account(&Account::new(id, AccountType::User)).unwrap();
        if funds > 0 {
            transactor
                .transact(TransferRequest::new(
                    SystemAccount::OnChain.id(),
                    id,
                    Decimal::from(funds),
                    format!("seed-{}", id),
                ))
                .unwrap();
        }
        id
    }

    #[test]
    fn test_transfer_moves_funds() {
        let (_dir, transactor) = setup();
        let (a, b) = (user(&transactor, 100), user(&transactor, 0));

        transactor
            .transact(TransferRequest::new(a, b, Decimal::from(30), "t1").group("STORE", "MECH"))
            .unwrap();
        assert_eq!(transactor.balance(&a).unwrap(), Decimal::from(70));
        assert_eq!(transactor.balance(&b).unwrap(), Decimal::from(30));
        assert!(transactor.audit().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_amount_and_self_transfer() {
        let (_dir, transactor) = setup();
        let a = user(&transactor, 10);
        let b = user(&transactor, 0);
        assert!(matches!(
            transactor.transact(TransferRequest::new(a, b, Decimal::ZERO, "zero")),
            Err(PassportError::InvalidAmount(_))
        ));
        assert!(matches!(
            transactor.transact(TransferRequest::new(a, a, Decimal::ONE, "self")),
            Err(PassportError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_replay_returns_same_id() {
        let (_dir, transactor) = setup();
        let (a, b) = (user(&transactor, 100), user(&transactor, 0));

        let first = transactor.transact(TransferRequest::new(a, b, Decimal::from(10), "dup")).unwrap();
        let second = transactor.transact(TransferRequest::new(a, b, Decimal::from(10), "dup")).unwrap();
        assert_eq!(first, second);
        assert_eq!(transactor.balance(&a).unwrap(), Decimal::from(90));
    }

    #[test]
    fn test_insufficient_funds_releases_reference() {
        let (_dir, transactor) = setup();
        let (a, b) = (user(&transactor, 5), user(&transactor, 0));

        let err = transactor
            .transact(TransferRequest::new(a, b, Decimal::from(10), "retry-me"))
            .unwrap_err();
        assert!(matches!(err, PassportError::InsufficientFunds { .. }));
        assert_eq!(transactor.balance(&a).unwrap(), Decimal::from(5));

        transactor
            .transact(TransferRequest::new(SystemAccount::OnChain.id(), a, Decimal::from(5), "topup"))
            .unwrap();
        transactor
            .transact(TransferRequest::new(a, b, Decimal::from(10), "retry-me"))
            .unwrap();
        assert_eq!(transactor.balance(&b).unwrap(), Decimal::from(10));
    }

    #[test]
    fn test_unknown_receiver_leaves_sender_untouched() {
        let (_dir, transactor) = setup();
        let a = user(&transactor, 10);
        let err = transactor
            .transact(TransferRequest::new(a, Uuid::new_v4(), Decimal::ONE, "ghost"))
            .unwrap_err();
        assert!(matches!(err, PassportError::NotFound(_)));
        assert_eq!(transactor.balance(&a).unwrap(), Decimal::from(10));
    }

    #[test]
    fn test_failed_credit_is_compensated() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let flaky = Arc::new(FlakyStore::with(&[(a, 50), (b, 0)]));
        flaky.fail_writes_for.lock().insert(b);
        let cache = Arc::new(BalanceCache::new(flaky.clone(), HashSet::new()));
        let transactor = Transactor::new(store, cache, EventBus::new());

        let err = transactor
            .transact(TransferRequest::new(a, b, Decimal::from(20), "half"))
            .unwrap_err();
        assert!(matches!(err, PassportError::StorageFault(_)));
        assert_eq!(transactor.balance(&a).unwrap(), Decimal::from(50));
        assert_eq!(flaky.balances.lock()[&a], Decimal::from(50));
        assert_eq!(
            transactor.store().find_by_reference("half").unwrap().unwrap().status,
            TxStatus::Failed
        );
    }

    #[test]
    fn test_refund_once_and_only_by_origin() {
        let (_dir, transactor) = setup();
        let (x, y) = (user(&transactor, 100), user(&transactor, 0));

        let mut req = TransferRequest::new(x, y, Decimal::from(40), "buy-1").description("Repair bay fee");
        req.service_id = Some("supremacy".into());
        let original = transactor.transact(req).unwrap();

        assert!(matches!(
            transactor.refund(&original, Some("other")),
            Err(PassportError::Forbidden(_))
        ));

        let refund = transactor.refund(&original, Some("supremacy")).unwrap();
        let row = transactor.store().get_transaction(&refund).unwrap().unwrap();
        assert_eq!(row.related_transaction_id, Some(original));
        assert_eq!(row.reference, "REFUND - buy-1");
        assert_eq!(row.description, "Reverse transaction - Repair bay fee");
        assert_eq!(transactor.balance(&x).unwrap(), Decimal::from(100));
        assert_eq!(transactor.balance(&y).unwrap(), Decimal::ZERO);

        assert!(matches!(
            transactor.refund(&original, Some("supremacy")),
            Err(PassportError::Conflict(_))
        ));
        assert!(matches!(
            transactor.refund(&refund, Some("supremacy")),
            Err(PassportError::Conflict(_))
        ));
        assert!(matches!(
            transactor.refund(&Uuid::new_v4(), None),
            Err(PassportError::NotFound(_))
        ));
    }

    #[test]
    fn test_recover_pending_rows() {
        let (_dir, transactor) = setup();
        let (a, b, c, d) = (
            user(&transactor, 100),
            user(&transactor, 0),
            user(&transactor, 100),
            user(&transactor, 0),
        );
        let store = transactor.store().clone();

        // Debit applied, credit lost
        let half = Transaction {
            id: Uuid::new_v4(),
            from_account: a,
            to_account: b,
            amount: Decimal::from(25),
            reference: "crash-half".into(),
            description: String::new(),
            group: String::new(),
            sub_group: String::new(),
            related_transaction_id: None,
            service_id: None,
            status: TxStatus::Pending,
            created_at: Utc::now(),
        };
        store.reserve_transaction(&half).unwrap();
        transactor.cache().apply_delta(&a, Decimal::from(-25)).unwrap();

        // Both legs applied, commit lost
        let mut full = half.clone();
        full.id = Uuid::new_v4();
        full.from_account = c;
        full.to_account = d;
        full.reference = "crash-full".into();
        store.reserve_transaction(&full).unwrap();
        transactor.cache().apply_delta(&c, Decimal::from(-25)).unwrap();
        transactor.cache().apply_delta(&d, Decimal::from(25)).unwrap();

        let report = transactor.recover_pending().unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.rolled_back, 1);
        assert!(report.ambiguous.is_empty());
        assert_eq!(transactor.balance(&a).unwrap(), Decimal::from(100));
        assert_eq!(transactor.balance(&d).unwrap(), Decimal::from(25));
        assert!(transactor.audit().unwrap().is_empty());
    }
}
