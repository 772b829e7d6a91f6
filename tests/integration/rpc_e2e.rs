//! E2E tests of the service RPC surface

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use passport::assets::NewAsset;
use passport::kv::{KvStore, SYNDICATE_CREATE_FEE, SYNDICATE_CREATE_FEE_CUT};
use passport::rpc::{create_rpc_router, RpcState};
use passport::types::{AccountId, ApiKeyType, OnChainStatus, SystemAccount, TransferRequest};
use passport::{AccountDirectory, AssetEngine, BalanceCache, EventBus, LedgerStore, Transactor};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;
use uuid::Uuid;

struct TestRpc {
    _dir: TempDir,
    state: RpcState,
    kv: KvStore,
    key: String,
}

impl TestRpc {
    fn router(&self) -> Router {
        create_rpc_router(self.state.clone())
    }

    async fn call(&self, method: &str, mut params: Value) -> (StatusCode, Value) {
        params["api_key"] = json!(self.key);
        call(self.router(), method, params).await
    }

    fn funded_user(&self, name: &str, funds: i64) -> AccountId {
        let user = self.state.accounts.create_user(name).unwrap();
        self.state
            .transactor
            .transact(TransferRequest::new(
                SystemAccount::OnChain.id(),
                user.id,
                Decimal::from(funds),
                format!("seed-{}", name),
            ))
            .unwrap();
        user.id
    }
}

fn create_test_rpc() -> TestRpc {
    let dir = TempDir::new().unwrap();
    let store = LedgerStore::open(dir.path()).unwrap();
    let cache = Arc::new(BalanceCache::new(
        Arc::new(store.clone()),
        HashSet::from([SystemAccount::OnChain.id()]),
    ));
    let transactor = Arc::new(Transactor::new(store.clone(), cache, EventBus::new()));
    let kv = KvStore::new(store.clone());
    let accounts = Arc::new(AccountDirectory::new(store.clone(), transactor.clone(), kv.clone()));
    accounts.seed_system_accounts().unwrap();
    let key = accounts
        .issue_api_key("supremacy", ApiKeyType::ServerClient)
        .unwrap();

    TestRpc {
        _dir: dir,
        state: RpcState {
            accounts,
            transactor,
            assets: Arc::new(AssetEngine::new(store, EventBus::new())),
        },
        kv,
        key,
    }
}

async fn call(app: Router, method: &str, params: Value) -> (StatusCode, Value) {
    let body = json!({ "method": method, "params": params });
    let req = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json")
        .body(Body::from(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn e2e_ping() {
    let rpc = create_test_rpc();
    let (status, body) = call(rpc.router(), "Ping", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "pong");
}

#[tokio::test]
async fn e2e_missing_key_is_forbidden() {
    let rpc = create_test_rpc();
    let (status, body) = call(rpc.router(), "UserBalanceGet", json!({ "user_id": Uuid::new_v4() })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn e2e_spend_is_idempotent_per_reference() {
    let rpc = create_test_rpc();
    let alice = rpc.funded_user("alice", 100);
    let params = json!({
        "from_user_id": alice,
        "to_user_id": SystemAccount::SupremacyGame.id(),
        "amount": "25",
        "transaction_reference": "queue_join|alice|1",
        "description": "Battle queue fee",
        "group": "SUPREMACY",
        "sub_group": "BATTLE",
    });

    let (status, first) = rpc.call("SpendSups", params.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = rpc.call("SpendSups", params).await;
    assert_eq!(first["result"]["transaction_id"], second["result"]["transaction_id"]);

    let (_, balance) = rpc.call("UserBalanceGet", json!({ "user_id": alice })).await;
    assert_eq!(balance["result"]["balance"], "75");
}

#[tokio::test]
async fn e2e_spend_overdraft() {
    let rpc = create_test_rpc();
    let alice = rpc.funded_user("alice", 10);
    let (status, body) = rpc
        .call(
            "SpendSups",
            json!({
                "from_user_id": alice,
                "to_user_id": SystemAccount::SupremacyGame.id(),
                "amount": "11",
                "transaction_reference": "too-much",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Insufficient funds.");
}

#[tokio::test]
async fn e2e_refund_only_once() {
    let rpc = create_test_rpc();
    let alice = rpc.funded_user("alice", 50);
    let (_, spent) = rpc
        .call(
            "SpendSups",
            json!({
                "from_user_id": alice,
                "to_user_id": SystemAccount::SupremacyGame.id(),
                "amount": "20",
                "transaction_reference": "repair|1",
            }),
        )
        .await;
    let tx_id = spent["result"]["transaction_id"].clone();

    let (status, _) = rpc.call("RefundTransaction", json!({ "transaction_id": tx_id })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = rpc.call("RefundTransaction", json!({ "transaction_id": tx_id })).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, balance) = rpc.call("UserBalanceGet", json!({ "user_id": alice })).await;
    assert_eq!(balance["result"]["balance"], "50");
}

#[tokio::test]
async fn e2e_asset_lock_and_transfer() {
    let rpc = create_test_rpc();
    let alice = rpc.funded_user("alice", 1);
    let bob = rpc.funded_user("bob", 1);
    let asset = rpc
        .state
        .assets
        .register(NewAsset {
            collection_id: Uuid::nil(),
            token_id: 42,
            owner_id: alice,
            name: "Boston Cybernetics Law Enforcer X-1000".into(),
            hash: None,
            on_chain_status: OnChainStatus::Stakable,
            locked_to_service: Some("marketplace".into()),
        })
        .unwrap();

    // Held by another service
    let (status, _) = rpc
        .call(
            "AssetTransferOwnership",
            json!({ "from_owner_id": alice, "to_owner_id": bob, "hash": asset.hash }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = rpc.call("AssetLockToService", json!({ "hash": asset.hash })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    rpc.state.assets.unlock_from_service(&asset.hash, "marketplace").unwrap();
    let (status, locked) = rpc
        .call("AssetLockToService", json!({ "hash": asset.hash, "owner_id": alice }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["result"]["asset"]["locked_to_service"], "supremacy");

    let (status, moved) = rpc
        .call(
            "AssetTransferOwnership",
            json!({ "from_owner_id": alice, "to_owner_id": bob, "hash": asset.hash }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let event_id = moved["result"]["transfer_event_id"].as_u64().unwrap();

    let (_, events) = rpc
        .call("GetAssetTransferEvents", json!({ "from_event_id": event_id }))
        .await;
    let events = events["result"]["transfer_events"].as_array().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["initiated_from"], "supremacy");

    let (status, _) = rpc
        .call("AssetUnlockFromService", json!({ "hash": asset.hash, "owner_id": alice }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = rpc
        .call("AssetUnlockFromService", json!({ "hash": asset.hash, "owner_id": bob }))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn e2e_enlist_and_register_syndicate() {
    let rpc = create_test_rpc();
    rpc.kv.put_decimal(SYNDICATE_CREATE_FEE, Decimal::from(100)).unwrap();
    rpc.kv.put_decimal(SYNDICATE_CREATE_FEE_CUT, Decimal::new(5, 1)).unwrap();
    let founder = rpc.funded_user("founder", 120);

    let (status, _) = rpc
        .call(
            "UserFactionEnlist",
            json!({ "user_id": founder, "faction_id": SystemAccount::RedMountain.id() }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = rpc
        .call(
            "UserFactionEnlist",
            json!({ "user_id": founder, "faction_id": SystemAccount::Zaibatsu.id() }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let syndicate_id = Uuid::new_v4();
    let (status, body) = rpc
        .call(
            "SyndicateRegister",
            json!({ "syndicate_id": syndicate_id, "founder_id": founder, "name": "Crimson Vanguard" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["syndicate"]["name"], "Crimson Vanguard");

    let (_, balance) = rpc.call("UserBalanceGet", json!({ "user_id": founder })).await;
    assert_eq!(balance["result"]["balance"], "20");
    assert_eq!(rpc.state.transactor.balance(&syndicate_id).unwrap(), Decimal::from(50));
}
