//! Per-account balance cache
//!
//! Every account gets its own slot guarded by a mutex. Reads and mutations of
//! one account are serialized through that mutex while different accounts
//! proceed in parallel. Slots are loaded lazily from the ledger store and every
//! mutation is written through to the store before the in-memory value changes.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{PassportError, Result};
use crate::store::BalanceStore;
use crate::types::AccountId;

/// Cached balance of one account. `None` until first loaded.
#[derive(Default)]
pub struct AccountSlot {
    balance: Mutex<Option<Decimal>>,
}

pub struct BalanceCache {
    store: Arc<dyn BalanceStore>,
    slots: DashMap<AccountId, Arc<AccountSlot>>,
    /// Mint/burn accounts exempt from the non-negative rule
    allow_negative: HashSet<AccountId>,
}

/// Exclusive access to one account's balance
pub struct AccountGuard<'a> {
    id: AccountId,
    cache: &'a BalanceCache,
    balance: MutexGuard<'a, Option<Decimal>>,
}

impl BalanceCache {
    pub fn new(store: Arc<dyn BalanceStore>, allow_negative: HashSet<AccountId>) -> Self {
        Self {
            store,
            slots: DashMap::new(),
            allow_negative,
        }
    }

    pub fn allows_negative(&self, id: &AccountId) -> bool {
        self.allow_negative.contains(id)
    }

    /// Slot for `id`, created empty on first use
    pub fn slot(&self, id: &AccountId) -> Arc<AccountSlot> {
        self.slots.entry(*id).or_default().clone()
    }

    /// Current balance, loading it from the store on a miss
    pub fn get(&self, id: &AccountId) -> Result<Decimal> {
        let slot = self.slot(id);
        let mut guard = self.lock(id, &slot);
        guard.balance()
    }

    /// Add a signed delta to a single account
    pub fn apply_delta(&self, id: &AccountId, delta: Decimal) -> Result<Decimal> {
        let slot = self.slot(id);
        let mut guard = self.lock(id, &slot);
        guard.apply_delta(delta)
    }

    /// Lock a slot previously obtained with [`BalanceCache::slot`]
    pub fn lock<'a>(&'a self, id: &AccountId, slot: &'a AccountSlot) -> AccountGuard<'a> {
        AccountGuard {
            id: *id,
            cache: self,
            balance: slot.balance.lock(),
        }
    }

    pub fn cached_accounts(&self) -> usize {
        self.slots.len()
    }
}

impl AccountGuard<'_> {
    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn balance(&mut self) -> Result<Decimal> {
        if let Some(balance) = *self.balance {
            return Ok(balance);
        }
        let loaded = self
            .cache
            .store
            .load_balance(&self.id)?
            .ok_or_else(|| PassportError::NotFound(format!("account {}", self.id)))?;
        *self.balance = Some(loaded);
        debug!(account = %self.id, balance = %loaded, "Balance loaded into cache");
        Ok(loaded)
    }

    /// Apply `delta` and persist the result.
    ///
    /// A debit that would leave a non-exempt account below zero fails with
    /// `InsufficientFunds`. The cached value only changes once the store has
    /// accepted the new balance.
    pub fn apply_delta(&mut self, delta: Decimal) -> Result<Decimal> {
        let current = self.balance()?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| PassportError::InvalidAmount(format!("{} + {} overflows", current, delta)))?;

        if delta < Decimal::ZERO && next < Decimal::ZERO && !self.cache.allows_negative(&self.id) {
            return Err(PassportError::InsufficientFunds {
                account: self.id.to_string(),
                balance: current.to_string(),
                required: (-delta).to_string(),
            });
        }

        if let Err(e) = self.cache.store.store_balance(&self.id, next) {
            warn!(account = %self.id, %delta, error = %e, "Durable balance write failed");
            return Err(match e {
                PassportError::StorageFault(_) => e,
                other => PassportError::StorageFault(other.to_string()),
            });
        }
        *self.balance = Some(next);
        Ok(next)
    }
}
