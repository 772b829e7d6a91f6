//! Ledger properties under concurrent load

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use passport::error::PassportError;
use passport::kv::KvStore;
use passport::types::{AccountId, SystemAccount, TransferRequest};
use passport::{AccountDirectory, BalanceCache, EventBus, LedgerStore, Transactor};
use rust_decimal::Decimal;
use tempfile::TempDir;

struct Ledger {
    _dir: TempDir,
    store: LedgerStore,
    transactor: Arc<Transactor>,
    accounts: AccountDirectory,
}

fn ledger() -> Ledger {
    let dir = TempDir::new().unwrap();
    let store = LedgerStore::open(dir.path()).unwrap();
    let cache = Arc::new(BalanceCache::new(
        Arc::new(store.clone()),
        HashSet::from([SystemAccount::OnChain.id()]),
    ));
    let transactor = Arc::new(Transactor::new(store.clone(), cache, EventBus::new()));
    let accounts = AccountDirectory::new(store.clone(), transactor.clone(), KvStore::new(store.clone()));
    accounts.seed_system_accounts().unwrap();
    Ledger {
        _dir: dir,
        store,
        transactor,
        accounts,
    }
}

fn funded_user(ledger: &Ledger, name: &str, funds: i64) -> AccountId {
    let user = ledger.accounts.create_user(name).unwrap();
    if funds > 0 {
        ledger
            .transactor
            .transact(TransferRequest::new(
                SystemAccount::OnChain.id(),
                user.id,
                Decimal::from(funds),
                format!("seed-{}", name),
            ))
            .unwrap();
    }
    user.id
}

#[test]
fn concurrent_transfers_conserve_value() {
    let ledger = ledger();
    let users: Vec<AccountId> = (0..4).map(|i| funded_user(&ledger, &format!("u{}", i), 1_000)).collect();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let transactor = ledger.transactor.clone();
            let users = users.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let from = users[(worker + i) % users.len()];
                    let to = users[(worker + i + 1) % users.len()];
                    let result = transactor.transact(TransferRequest::new(
                        from,
                        to,
                        Decimal::from(7),
                        format!("w{}-{}", worker, i),
                    ));
                    match result {
                        Ok(_) | Err(PassportError::InsufficientFunds { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut total = Decimal::ZERO;
    for user in &users {
        let balance = ledger.transactor.balance(user).unwrap();
        assert!(balance >= Decimal::ZERO);
        total += balance;
    }
    assert_eq!(total, Decimal::from(4_000));
    assert!(ledger.transactor.audit().unwrap().is_empty());
}

#[test]
fn opposing_transfers_do_not_deadlock() {
    let ledger = ledger();
    let a = funded_user(&ledger, "a", 500);
    let b = funded_user(&ledger, "b", 500);

    let spawn = |from: AccountId, to: AccountId, tag: &'static str| {
        let transactor = ledger.transactor.clone();
        thread::spawn(move || {
            for i in 0..200 {
                transactor
                    .transact(TransferRequest::new(from, to, Decimal::ONE, format!("{}-{}", tag, i)))
                    .unwrap();
            }
        })
    };
    let ab = spawn(a, b, "ab");
    let ba = spawn(b, a, "ba");
    ab.join().unwrap();
    ba.join().unwrap();

    assert_eq!(ledger.transactor.balance(&a).unwrap(), Decimal::from(500));
    assert_eq!(ledger.transactor.balance(&b).unwrap(), Decimal::from(500));
}

#[test]
fn racing_duplicate_reference_moves_funds_once() {
    let ledger = ledger();
    let payer = funded_user(&ledger, "payer", 100);
    let payee = funded_user(&ledger, "payee", 0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let transactor = ledger.transactor.clone();
            thread::spawn(move || {
                transactor.transact(TransferRequest::new(payer, payee, Decimal::from(10), "order-42"))
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        match handle.join().unwrap() {
            Ok(id) => {
                ids.insert(id);
            }
            Err(PassportError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(ledger.transactor.balance(&payer).unwrap(), Decimal::from(90));
    assert_eq!(ledger.transactor.balance(&payee).unwrap(), Decimal::from(10));

    // A retry after the race settles returns the committed id
    let retry = ledger
        .transactor
        .transact(TransferRequest::new(payer, payee, Decimal::from(10), "order-42"))
        .unwrap();
    assert!(ids.contains(&retry));
}

#[tokio::test]
async fn balances_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (alice, bob) = {
        let store = LedgerStore::open(dir.path()).unwrap();
        let cache = Arc::new(BalanceCache::new(
            Arc::new(store.clone()),
            HashSet::from([SystemAccount::OnChain.id()]),
        ));
        let transactor = Arc::new(Transactor::new(store.clone(), cache, EventBus::new()));
        let accounts = AccountDirectory::new(store.clone(), transactor.clone(), KvStore::new(store.clone()));
        accounts.seed_system_accounts().unwrap();
        let alice = accounts.create_user("alice").unwrap().id;
        let bob = accounts.create_user("bob").unwrap().id;
        transactor
            .transact(TransferRequest::new(SystemAccount::OnChain.id(), alice, Decimal::from(50), "seed"))
            .unwrap();
        transactor
            .transact(TransferRequest::new(alice, bob, Decimal::from(20), "gift"))
            .unwrap();
        store.flush().await.unwrap();
        (alice, bob)
    };

    let store = LedgerStore::open(dir.path()).unwrap();
    let cache = Arc::new(BalanceCache::new(Arc::new(store.clone()), HashSet::new()));
    let transactor = Transactor::new(store, cache, EventBus::new());
    assert_eq!(transactor.recover_pending().unwrap().ambiguous.len(), 0);
    assert_eq!(transactor.balance(&alice).unwrap(), Decimal::from(30));
    assert_eq!(transactor.balance(&bob).unwrap(), Decimal::from(20));
    assert!(transactor.audit().unwrap().is_empty());
}

#[test]
fn history_lists_seed_credit() {
    let ledger = ledger();
    let user = funded_user(&ledger, "solo", 5);
    let history = ledger.store.list_transactions_for_account(&user, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].amount, Decimal::from(5));
}
