//! Reconciliation against an in-memory indexer: exactly-once crediting,
//! escrow reversal, the rollback breaker and the scheduler

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use passport::config::Config;
use passport::error::{PassportError, Result};
use passport::health::IndexerHealth;
use passport::indexer::{EventSource, FeedPath, NftOwnerRecord, PurchaseRecord, SupTransferRecord};
use passport::kv::{self, KvStore};
use passport::nft_sync::NftSync;
use passport::reconcile::Reconciler;
use passport::scheduler::{SyncJob, SyncScheduler};
use passport::types::{SystemAccount, TransferRequest};
use passport::{AccountDirectory, AssetEngine, BalanceCache, Escrow, EventBus, LedgerStore, Transactor};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio::sync::watch;

#[derive(Default)]
struct MemoryIndexer {
    transfers: Mutex<HashMap<FeedPath, Vec<SupTransferRecord>>>,
    down: AtomicBool,
}

impl MemoryIndexer {
    fn push(&self, path: FeedPath, record: SupTransferRecord) {
        self.transfers.lock().entry(path).or_default().push(record);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(PassportError::UpstreamUnavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventSource for MemoryIndexer {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn sup_transfers(&self, path: FeedPath, since_block: u64) -> Result<Vec<SupTransferRecord>> {
        self.check()?;
        // Inclusive like the real indexer, so the boundary block is redelivered
        Ok(self
            .transfers
            .lock()
            .get(&path)
            .map(|rs| rs.iter().filter(|r| r.block_number >= since_block).cloned().collect())
            .unwrap_or_default())
    }

    async fn purchases(&self, _path: FeedPath, _since_block: u64) -> Result<Vec<PurchaseRecord>> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn nft_owners(&self, _contract: &str) -> Result<Vec<NftOwnerRecord>> {
        self.check()?;
        Ok(Vec::new())
    }
}

fn record(tx_hash: &str, block: u64, from: &str, to: &str, sups: u64) -> SupTransferRecord {
    SupTransferRecord {
        tx_hash: tx_hash.into(),
        log_index: 0,
        time: 0,
        chain: 56,
        block_number: block,
        confirmations: 15,
        from_address: from.into(),
        to_address: to.into(),
        contract_address: String::new(),
        value_int: format!("{}000000000000000000", sups),
        value_decimals: 18,
    }
}

fn sups(n: u64) -> Decimal {
    Decimal::from(n) * Decimal::from(1_000_000_000_000_000_000u64)
}

struct World {
    _dir: TempDir,
    indexer: Arc<MemoryIndexer>,
    transactor: Arc<Transactor>,
    accounts: Arc<AccountDirectory>,
    escrow: Arc<Escrow>,
    health: Arc<IndexerHealth>,
    reconciler: Arc<Reconciler>,
    nft_sync: Arc<NftSync>,
    kv: KvStore,
}

/// Holds expire as soon as they are created
fn world() -> World {
    let dir = TempDir::new().unwrap();
    let store = LedgerStore::open(dir.path()).unwrap();
    let mut config = Config::default();
    config.sync.withdraw_expiry_secs = 0;
    config.sync.refund_grace_secs = -1;

    let cache = Arc::new(BalanceCache::new(
        Arc::new(store.clone()),
        HashSet::from([SystemAccount::OnChain.id(), SystemAccount::XsynSale.id()]),
    ));
    let transactor = Arc::new(Transactor::new(store.clone(), cache, EventBus::new()));
    let kv = KvStore::new(store.clone());
    let accounts = Arc::new(AccountDirectory::new(store.clone(), transactor.clone(), kv.clone()));
    accounts.seed_system_accounts().unwrap();
    let assets = Arc::new(AssetEngine::new(store.clone(), EventBus::new()));
    let escrow = Arc::new(Escrow::new(transactor.clone(), &config.sync));
    let health = Arc::new(IndexerHealth::new(kv.clone(), &config.sync));
    let indexer = Arc::new(MemoryIndexer::default());
    let source: Arc<dyn EventSource> = indexer.clone();
    let reconciler = Arc::new(Reconciler::new(
        source.clone(),
        transactor.clone(),
        accounts.clone(),
        escrow.clone(),
        health.clone(),
        kv.clone(),
        config.indexer.purchase_contract.clone(),
    ));
    let nft_sync = Arc::new(NftSync::new(source, store, assets, accounts.clone(), health.clone()));
    World {
        _dir: dir,
        indexer,
        transactor,
        accounts,
        escrow,
        health,
        reconciler,
        nft_sync,
        kv,
    }
}

#[tokio::test]
async fn deposits_credit_exactly_once_across_overlapping_batches() {
    let w = world();
    w.indexer.push(FeedPath::SupsDepositBsc, record("0xa1", 10, "0xAlice", "0xbridge", 5));
    w.indexer.push(FeedPath::SupsDepositBsc, record("0xa2", 12, "0xAlice", "0xbridge", 7));
    w.reconciler.sync_deposits().await.unwrap();

    // Block 12 redelivered alongside a new one
    w.indexer.push(FeedPath::SupsDepositBsc, record("0xa2", 12, "0xAlice", "0xbridge", 7));
    w.indexer.push(FeedPath::SupsDepositBsc, record("0xa4", 13, "0xAlice", "0xbridge", 1));
    w.reconciler.sync_deposits().await.unwrap();
    w.reconciler.sync_deposits().await.unwrap();

    let alice = w.accounts.create_or_get_user_by_address("0xalice").unwrap();
    assert_eq!(w.transactor.balance(&alice.id).unwrap(), sups(13));
    assert_eq!(w.kv.get_u64(kv::LATEST_DEPOSIT_BLOCK, 0).unwrap(), 13);

    // Replaying the whole feed is absorbed by the reference check
    w.kv.put_u64(kv::LATEST_DEPOSIT_BLOCK, 0).unwrap();
    let replay = w.reconciler.sync_deposits().await.unwrap();
    assert_eq!(replay.success, 0);
    assert_eq!(w.transactor.balance(&alice.id).unwrap(), sups(13));

    let history = w.transactor.store().list_transactions_for_account(&alice.id, 10).unwrap();
    assert_eq!(history.len(), 3);
    assert!(w.transactor.audit().unwrap().is_empty());
}

#[tokio::test]
async fn disabled_chain_feed_is_ignored() {
    let w = world();
    w.indexer.push(FeedPath::SupsDepositEth, record("0xe1", 3, "0xCarol", "0xbridge", 4));
    w.reconciler.sync_deposits().await.unwrap();
    let carol = w.accounts.create_or_get_user_by_address("0xcarol").unwrap();
    assert_eq!(w.transactor.balance(&carol.id).unwrap(), Decimal::ZERO);

    w.kv.put_bool(kv::ENABLE_ETH_DEPOSITS, true).unwrap();
    w.reconciler.sync_deposits().await.unwrap();
    assert_eq!(w.transactor.balance(&carol.id).unwrap(), sups(4));
}

#[tokio::test]
async fn unconfirmed_withdrawal_is_reversed_and_confirmed_one_is_kept() {
    let w = world();
    w.kv.put_bool(kv::ENABLE_WITHDRAW_ROLLBACK, true).unwrap();
    let alice = w.accounts.create_or_get_user_by_address("0xalice").unwrap();
    w.transactor
        .transact(TransferRequest::new(SystemAccount::OnChain.id(), alice.id, sups(10), "seed"))
        .unwrap();

    let confirmed = w.escrow.hold_withdrawal(&alice.id, sups(3)).unwrap();
    let abandoned = w.escrow.hold_withdrawal(&alice.id, sups(4)).unwrap();
    assert_eq!(w.transactor.balance(&alice.id).unwrap(), sups(3));

    w.indexer.push(FeedPath::SupsWithdrawBsc, record("0xW1", 50, "0xbridge", "0xALICE", 3));
    let report = w.reconciler.sync_withdrawals().await.unwrap();
    assert_eq!(report.attached, 1);
    assert_eq!(report.reversal.reversed, 1);
    assert!(!report.reversal.dry_run);

    assert_eq!(w.transactor.balance(&alice.id).unwrap(), sups(7));
    let holds = w.escrow.list_for_user(&alice.id).unwrap();
    let kept = holds.iter().find(|h| h.id == confirmed.id).unwrap();
    assert_eq!(kept.tx_hash.as_deref(), Some("0xw1"));
    assert!(!kept.is_refunded);
    let reversed = holds.iter().find(|h| h.id == abandoned.id).unwrap();
    assert!(reversed.is_refunded);

    let reversal = w
        .transactor
        .store()
        .get_transaction(&reversed.reversal_transaction_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(reversal.related_transaction_id, Some(abandoned.withdraw_transaction_id));
    assert!(reversal.reference.starts_with("REFUND "));

    // Nothing left to reverse
    let again = w.reconciler.sync_withdrawals().await.unwrap();
    assert_eq!(again.reversal.reversed, 0);
    assert_eq!(w.transactor.balance(&alice.id).unwrap(), sups(7));
}

#[tokio::test]
async fn failing_indexer_stops_reversals() {
    let w = world();
    w.kv.put_bool(kv::ENABLE_WITHDRAW_ROLLBACK, true).unwrap();
    let dave = w.accounts.create_or_get_user_by_address("0xdave").unwrap();
    w.transactor
        .transact(TransferRequest::new(SystemAccount::OnChain.id(), dave.id, sups(5), "seed"))
        .unwrap();
    w.escrow.hold_withdrawal(&dave.id, sups(5)).unwrap();

    w.indexer.down.store(true, Ordering::SeqCst);
    for _ in 0..6 {
        assert!(w.reconciler.ping().await.is_err());
    }
    assert!(!w.health.rollback_enabled().unwrap());

    // Feed back up, but the breaker needs more than a single success
    w.indexer.down.store(false, Ordering::SeqCst);
    let report = w.reconciler.sync_withdrawals().await.unwrap();
    assert!(report.reversal.dry_run);
    assert_eq!(report.reversal.reversed, 1);
    assert_eq!(w.transactor.balance(&dave.id).unwrap(), Decimal::ZERO);

    for _ in 0..10 {
        w.reconciler.ping().await.unwrap();
    }
    assert!(w.health.rollback_enabled().unwrap());
    let report = w.reconciler.sync_withdrawals().await.unwrap();
    assert!(!report.reversal.dry_run);
    assert_eq!(w.transactor.balance(&dave.id).unwrap(), sups(5));
}

#[tokio::test]
async fn scheduler_runs_only_enabled_jobs() {
    let w = world();
    w.indexer.push(FeedPath::SupsDepositBsc, record("0xs1", 8, "0xErin", "0xbridge", 2));
    let scheduler = Arc::new(SyncScheduler::with_intervals(
        w.reconciler.clone(),
        w.nft_sync.clone(),
        w.kv.clone(),
        Duration::from_millis(20),
        Duration::from_secs(5),
    ));

    scheduler.tick_once(SyncJob::Deposits).await;
    let erin = w.accounts.create_or_get_user_by_address("0xerin").unwrap();
    assert_eq!(w.transactor.balance(&erin.id).unwrap(), Decimal::ZERO);

    w.kv.put_bool(kv::ENABLE_SYNC_DEPOSITS, true).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = scheduler.clone().spawn(shutdown_rx);
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    assert_eq!(w.transactor.balance(&erin.id).unwrap(), sups(2));
    // Ping ran too
    assert!(w.health.counters().unwrap().1 > 0);
}
