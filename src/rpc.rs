//! Service-to-service RPC surface
//!
//! Game services call `POST /rpc` with `{"method": ..., "params": {...}}`.
//! Every params object carries the caller's `api_key`; the service id behind
//! the key is what gets recorded on transactions and checked against asset
//! locks. Replies are `{"result": ...}` or `{"error": ...}` with the HTTP
//! status of the underlying error.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountDirectory;
use crate::assets::{AssetEngine, NewAsset};
use crate::error::{PassportError, Result};
use crate::transactor::Transactor;
use crate::types::{parse_positive_amount, AccountId, OnChainStatus, TransactionId, TransferRequest};

/// Page size of `GetAssetTransferEvents` when the caller gives none
const DEFAULT_EVENT_PAGE: usize = 100;
const MAX_EVENT_PAGE: usize = 1000;

#[derive(Clone)]
pub struct RpcState {
    pub accounts: Arc<AccountDirectory>,
    pub transactor: Arc<Transactor>,
    pub assets: Arc<AssetEngine>,
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
struct SpendSupsParams {
    from_user_id: AccountId,
    to_user_id: AccountId,
    amount: String,
    transaction_reference: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    sub_group: String,
}

#[derive(Debug, Deserialize)]
struct RefundTransactionParams {
    transaction_id: TransactionId,
}

#[derive(Debug, Deserialize)]
struct AssetTransferOwnershipParams {
    from_owner_id: AccountId,
    to_owner_id: AccountId,
    hash: String,
    related_transaction_id: Option<TransactionId>,
}

#[derive(Debug, Deserialize)]
struct GetAssetTransferEventsParams {
    #[serde(default)]
    from_event_id: u64,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AssetLockParams {
    hash: String,
    owner_id: Option<AccountId>,
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user_id: AccountId,
}

#[derive(Debug, Deserialize)]
struct UserFactionEnlistParams {
    user_id: AccountId,
    faction_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SyndicateRegisterParams {
    syndicate_id: Uuid,
    founder_id: AccountId,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AssetRegisterParams {
    collection_id: Uuid,
    token_id: u64,
    owner_id: AccountId,
    name: String,
    hash: Option<String>,
    on_chain_status: Option<OnChainStatus>,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| PassportError::InvalidInput(e.to_string()))
}

/// Authenticate the caller and return its service id
fn authenticate(state: &RpcState, params: &Value) -> Result<String> {
    let key = params.get("api_key").and_then(Value::as_str).unwrap_or_default();
    state.accounts.authenticate_server_client(key)
}

/// Run one RPC method. Unknown methods are `NotFound`.
pub fn dispatch(state: &RpcState, method: &str, params: Value) -> Result<Value> {
    if method == "Ping" {
        return Ok(json!("pong"));
    }
    let service = authenticate(state, &params)?;
    debug!(method, service = %service, "RPC call");

    match method {
        "SpendSups" => {
            let p: SpendSupsParams = parse_params(params)?;
            let amount = parse_positive_amount(&p.amount)?;
            let tx_id = state.transactor.transact(
                TransferRequest::new(p.from_user_id, p.to_user_id, amount, p.transaction_reference)
                    .description(p.description)
                    .group(p.group, p.sub_group)
                    .service(service),
            )?;
            Ok(json!({ "transaction_id": tx_id }))
        }
        "RefundTransaction" => {
            let p: RefundTransactionParams = parse_params(params)?;
            let refund_id = state.transactor.refund(&p.transaction_id, Some(service.as_str()))?;
            Ok(json!({ "transaction_id": refund_id }))
        }
        "AssetTransferOwnership" => {
            let p: AssetTransferOwnershipParams = parse_params(params)?;
            let (_, event_id) = state.assets.transfer(
                &p.hash,
                &p.from_owner_id,
                &p.to_owner_id,
                Some(service.as_str()),
                p.related_transaction_id,
            )?;
            Ok(json!({ "transfer_event_id": event_id }))
        }
        "GetAssetTransferEvents" => {
            let p: GetAssetTransferEventsParams = parse_params(params)?;
            let limit = p.limit.unwrap_or(DEFAULT_EVENT_PAGE).clamp(1, MAX_EVENT_PAGE);
            // from_event_id is inclusive
            let events = state
                .assets
                .transfer_events_since(p.from_event_id.saturating_sub(1), limit)?;
            Ok(json!({ "transfer_events": events }))
        }
        "AssetLockToService" => {
            let p: AssetLockParams = parse_params(params)?;
            let owner = match p.owner_id {
                Some(owner) => owner,
                None => state.assets.get_by_hash(&p.hash)?.owner_id,
            };
            let asset = state.assets.lock_to_service(&p.hash, &owner, &service)?;
            Ok(json!({ "asset": asset }))
        }
        "AssetUnlockFromService" => {
            let p: AssetLockParams = parse_params(params)?;
            if let Some(owner) = p.owner_id {
                let asset = state.assets.get_by_hash(&p.hash)?;
                if asset.owner_id != owner {
                    return Err(PassportError::NotFound(format!("asset {} not owned by {}", p.hash, owner)));
                }
            }
            let asset = state.assets.unlock_from_service(&p.hash, &service)?;
            Ok(json!({ "asset": asset }))
        }
        "UserBalanceGet" => {
            let p: UserParams = parse_params(params)?;
            state.accounts.get_user(&p.user_id)?;
            let balance = state.transactor.balance(&p.user_id)?;
            Ok(json!({ "balance": balance.to_string() }))
        }
        "UserFactionEnlist" => {
            let p: UserFactionEnlistParams = parse_params(params)?;
            let user = state.accounts.enlist_faction(&p.user_id, &p.faction_id)?;
            Ok(json!({ "user": user }))
        }
        "SyndicateRegister" => {
            let p: SyndicateRegisterParams = parse_params(params)?;
            let syndicate = state
                .accounts
                .register_syndicate(p.syndicate_id, &p.founder_id, &p.name, &service)?;
            Ok(json!({ "syndicate": syndicate }))
        }
        "AssetRegister" => {
            let p: AssetRegisterParams = parse_params(params)?;
            state.accounts.get_user(&p.owner_id)?;
            // Items registered by a service start out held by it
            let asset = state.assets.register(NewAsset {
                collection_id: p.collection_id,
                token_id: p.token_id,
                owner_id: p.owner_id,
                name: p.name,
                hash: p.hash,
                on_chain_status: p.on_chain_status.unwrap_or(OnChainStatus::Mintable),
                locked_to_service: Some(service),
            })?;
            Ok(json!({ "asset": asset }))
        }
        other => Err(PassportError::NotFound(format!("rpc method {}", other))),
    }
}

async fn rpc_handler(State(state): State<RpcState>, Json(request): Json<RpcRequest>) -> (StatusCode, Json<Value>) {
    match dispatch(&state, &request.method, request.params) {
        Ok(result) => (StatusCode::OK, Json(json!({ "result": result }))),
        Err(e) => {
            warn!(method = %request.method, error = %e, "RPC call failed");
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "error": e.safe_message() })))
        }
    }
}

pub fn create_rpc_router(state: RpcState) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start RPC server
pub async fn start_rpc_server(state: RpcState, listen_addr: String) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let app = create_rpc_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("RPC server listening on http://{}/rpc", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
