//! E2E API integration tests

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use passport::api::{create_router, ApiState};
use passport::assets::NewAsset;
use passport::config::Config;
use passport::error::Result;
use passport::health::IndexerHealth;
use passport::indexer::{EventSource, FeedPath, NftOwnerRecord, PurchaseRecord, SupTransferRecord};
use passport::kv::KvStore;
use passport::reconcile::Reconciler;
use passport::types::{AccountId, OnChainStatus, SystemAccount, TransferRequest};
use passport::{AccountDirectory, AssetEngine, BalanceCache, Escrow, EventBus, LedgerStore, Transactor};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;
use uuid::Uuid;

/// Indexer with nothing to report
struct QuietIndexer;

#[async_trait]
impl EventSource for QuietIndexer {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn sup_transfers(&self, _path: FeedPath, _since_block: u64) -> Result<Vec<SupTransferRecord>> {
        Ok(Vec::new())
    }

    async fn purchases(&self, _path: FeedPath, _since_block: u64) -> Result<Vec<PurchaseRecord>> {
        Ok(Vec::new())
    }

    async fn nft_owners(&self, _contract: &str) -> Result<Vec<NftOwnerRecord>> {
        Ok(Vec::new())
    }
}

struct TestApi {
    _dir: TempDir,
    state: ApiState,
}

impl TestApi {
    fn router(&self) -> Router {
        create_router(self.state.clone())
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

fn create_test_api_state() -> TestApi {
    let dir = TempDir::new().unwrap();
    let store = LedgerStore::open(dir.path()).unwrap();
    let mut config = Config::default();
    config.api.enable_cors = false;

    let cache = Arc::new(BalanceCache::new(
        Arc::new(store.clone()),
        HashSet::from([SystemAccount::OnChain.id()]),
    ));
    let transactor = Arc::new(Transactor::new(store.clone(), cache, EventBus::new()));
    let kv = KvStore::new(store.clone());
    let accounts = Arc::new(AccountDirectory::new(store.clone(), transactor.clone(), kv.clone()));
    accounts.seed_system_accounts().unwrap();
    let assets = Arc::new(AssetEngine::new(store, EventBus::new()));
    let escrow = Arc::new(Escrow::new(transactor.clone(), &config.sync));
    let health = Arc::new(IndexerHealth::new(kv.clone(), &config.sync));
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(QuietIndexer),
        transactor.clone(),
        accounts.clone(),
        escrow.clone(),
        health,
        kv,
        config.indexer.purchase_contract.clone(),
    ));
    let (ws_tx, _) = tokio::sync::broadcast::channel(100);

    TestApi {
        _dir: dir,
        state: ApiState {
            transactor,
            accounts,
            assets,
            escrow,
            reconciler,
            config,
            ws_tx,
        },
    }
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    read(response).await
}

async fn post(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn e2e_health() {
    let api = create_test_api_state();
    let (status, body) = get(api.router(), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "OK");
}

#[tokio::test]
async fn e2e_sign_up_starts_at_zero() {
    let api = create_test_api_state();
    let (status, body) = post(api.router(), "/api/v1/users", json!({ "username": "rookie" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "rookie");

    let id = body["data"]["id"].as_str().unwrap().to_string();
    let (_, balance) = get(api.router(), &format!("/api/v1/users/{}/balance", id)).await;
    assert_eq!(balance["data"]["balance"], "0");

    let (status, _) = post(api.router(), "/api/v1/users", json!({ "username": "  " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn e2e_balance_of_unknown_user() {
    let api = create_test_api_state();
    let (status, body) = get(api.router(), &format!("/api/v1/users/{}/balance", Uuid::new_v4())).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn e2e_withdraw_holds_funds() {
    let api = create_test_api_state();
    let user = api.funded_user("pilot", 100);

    let (status, body) = post(
        api.router(),
        "/api/v1/withdraw",
        json!({ "user_id": user, "amount": "40" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["amount"], "40");

    let (_, balance) = get(api.router(), &format!("/api/v1/users/{}/balance", user)).await;
    assert_eq!(balance["data"]["balance"], "60");

    let (_, holds) = get(api.router(), &format!("/api/v1/users/{}/withdrawals", user)).await;
    assert_eq!(holds["data"].as_array().unwrap().len(), 1);

    let (_, history) = get(api.router(), &format!("/api/v1/users/{}/transactions?limit=10", user)).await;
    assert_eq!(history["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn e2e_withdraw_rejects_overdraft() {
    let api = create_test_api_state();
    let user = api.funded_user("broke", 5);

    let (status, body) = post(
        api.router(),
        "/api/v1/withdraw",
        json!({ "user_id": user, "amount": "6" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Insufficient funds.");

    let (status, _) = post(
        api.router(),
        "/api/v1/withdraw",
        json!({ "user_id": user, "amount": "-1" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn e2e_register_deposit_once() {
    let api = create_test_api_state();
    let user = api.funded_user("saver", 1);
    let request = json!({ "user_id": user, "tx_hash": "0xABC", "amount": "1000" });

    let (status, body) = post(api.router(), "/api/v1/deposits", request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "PENDING");
    assert_eq!(body["data"]["tx_hash"], "0xabc");

    let (status, _) = post(api.router(), "/api/v1/deposits", request).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn e2e_assets_and_transfer_events() {
    let api = create_test_api_state();
    let alice = api.funded_user("alice", 1);
    let bob = api.funded_user("bob", 1);
    let asset = api
        .state
        .assets
        .register(NewAsset {
            collection_id: Uuid::nil(),
            token_id: 1,
            owner_id: alice,
            name: "Zaibatsu Tenshi".into(),
            hash: None,
            on_chain_status: OnChainStatus::Mintable,
            locked_to_service: None,
        })
        .unwrap();
    api.state.assets.transfer(&asset.hash, &alice, &bob, None, None).unwrap();

    let (status, body) = get(api.router(), &format!("/api/v1/assets/{}", asset.hash)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["owner_id"], json!(bob));

    let (_, owned) = get(api.router(), &format!("/api/v1/users/{}/assets", bob)).await;
    assert_eq!(owned["data"][0]["hash"], json!(asset.hash));
    let (_, owned) = get(api.router(), &format!("/api/v1/users/{}/assets", alice)).await;
    assert!(owned["data"].as_array().unwrap().is_empty());

    let (status, _) = get(api.router(), "/api/v1/assets/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, events) = get(api.router(), "/api/v1/transfer-events?from=0").await;
    let events = events["data"].as_array().unwrap().clone();
    assert_eq!(events.len(), 1);
    let last = events[0]["id"].as_u64().unwrap();

    let (_, later) = get(api.router(), &format!("/api/v1/transfer-events?from={}", last)).await;
    assert!(later["data"].as_array().unwrap().is_empty());
}
