//! Indexer health tracking
//!
//! Every indexer call outcome is recorded. A run of failures switches off
//! automatic withdraw rollback so an unreliable feed cannot trigger mass
//! reversals; a run of successes switches it back on. Counters live in the
//! kv store and survive restarts.

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::kv::{KvStore, AVANT_FAILURE_COUNT, AVANT_SUCCESS_COUNT, ENABLE_WITHDRAW_ROLLBACK};

pub struct IndexerHealth {
    kv: KvStore,
    failure_threshold: u64,
    success_threshold: u64,
    lock: Mutex<()>,
}

impl IndexerHealth {
    pub fn new(kv: KvStore, sync: &SyncConfig) -> Self {
        Self {
            kv,
            failure_threshold: sync.failure_threshold,
            success_threshold: sync.success_threshold,
            lock: Mutex::new(()),
        }
    }

    pub fn rollback_enabled(&self) -> Result<bool> {
        self.kv.get_bool(ENABLE_WITHDRAW_ROLLBACK, false)
    }

    pub fn record_success(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let successes = self.kv.get_u64(AVANT_SUCCESS_COUNT, 0)? + 1;
        self.kv.put_u64(AVANT_SUCCESS_COUNT, successes)?;
        self.kv.put_u64(AVANT_FAILURE_COUNT, 0)?;

        if successes > self.success_threshold && !self.rollback_enabled()? {
            info!(success_count = successes, "Indexer feed restored, resuming automatic withdraw rollbacks");
            self.kv.put_bool(ENABLE_WITHDRAW_ROLLBACK, true)?;
        }
        Ok(())
    }

    pub fn record_failure(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let failures = self.kv.get_u64(AVANT_FAILURE_COUNT, 0)? + 1;
        self.kv.put_u64(AVANT_FAILURE_COUNT, failures)?;
        self.kv.put_u64(AVANT_SUCCESS_COUNT, 0)?;
        debug!(failure_count = failures, "Indexer call failed");

        if failures > self.failure_threshold && self.rollback_enabled()? {
            error!(failure_count = failures, "Indexer feed failing, stopping automatic withdraw rollbacks");
            self.kv.put_bool(ENABLE_WITHDRAW_ROLLBACK, false)?;
        }
        Ok(())
    }

    /// Record the outcome of an indexer call and hand it back unchanged
    pub fn observe<T>(&self, outcome: Result<T>) -> Result<T> {
        let recorded = match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        };
        if let Err(e) = recorded {
            error!(error = %e, "Failed to persist indexer health counters");
        }
        outcome
    }

    pub fn counters(&self) -> Result<(u64, u64)> {
        Ok((
            self.kv.get_u64(AVANT_FAILURE_COUNT, 0)?,
            self.kv.get_u64(AVANT_SUCCESS_COUNT, 0)?,
        ))
    }
}
