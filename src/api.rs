//! REST API server for the passport ledger
//!
//! Provides HTTP endpoints for:
//! - User balances and transaction history
//! - Withdrawal holds and pending deposit registration
//! - Asset lookup and the asset transfer event feed
//! - WebSocket for real-time updates

use std::sync::Arc;

use axum::extract::ws::Message;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::accounts::AccountDirectory;
use crate::assets::AssetEngine;
use crate::config::Config;
use crate::error::PassportError;
use crate::escrow::Escrow;
use crate::reconcile::Reconciler;
use crate::transactor::Transactor;
use crate::types::{
    format_sups, parse_positive_amount, AccountId, AssetTransferEvent, DepositTransaction, PendingRefund,
    Transaction, User, UserAsset,
};
pub use crate::ws_events::WsEvent;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

/// WebSocket subscription request
#[derive(Debug, Deserialize)]
pub struct WsSubscribeRequest {
    pub subscribe: Vec<WsSubscription>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WsSubscription {
    #[serde(rename = "type")]
    pub sub_type: String,
    pub user_id: Option<String>,
    pub asset_hash: Option<String>,
}

impl WsSubscription {
    fn matches(&self, event: &WsEvent) -> bool {
        self.sub_type == event.kind()
            && self.user_id.as_ref().map(|u| event.involves_user(u)).unwrap_or(true)
            && self
                .asset_hash
                .as_ref()
                .map(|h| event.asset_hash() == Some(h.as_str()))
                .unwrap_or(true)
    }
}

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub transactor: Arc<Transactor>,
    pub accounts: Arc<AccountDirectory>,
    pub assets: Arc<AssetEngine>,
    pub escrow: Arc<Escrow>,
    pub reconciler: Arc<Reconciler>,
    pub config: Config,
    pub ws_tx: broadcast::Sender<WsEvent>,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Handler error. The cause is logged, the caller sees the safe message.
pub struct ApiError(PassportError);

impl From<PassportError> for ApiError {
    fn from(e: PassportError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, "API request failed");
        }
        (status, Json(ApiResponse::<()>::error(self.0.safe_message()))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

/// Balance response
#[derive(Debug, Serialize)]
pub struct BalanceInfo {
    pub user_id: AccountId,
    /// Base units
    pub balance: String,
    /// Whole SUPS, four decimal places
    pub sups: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TransferEventsQuery {
    #[serde(default)]
    pub from: u64,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub user_id: AccountId,
    pub amount: String,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub user_id: AccountId,
    pub tx_hash: String,
    pub amount: String,
}

fn page(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    let enable_cors = state.config.api.enable_cors;
    let enable_websocket = state.config.api.enable_websocket;

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/users", post(create_user))
        .route("/api/v1/users/:id/balance", get(get_balance))
        .route("/api/v1/users/:id/transactions", get(get_transactions))
        .route("/api/v1/users/:id/withdrawals", get(get_withdrawals))
        .route("/api/v1/users/:id/assets", get(get_user_assets))
        .route("/api/v1/withdraw", post(withdraw))
        .route("/api/v1/deposits", post(register_deposit))
        .route("/api/v1/assets/:hash", get(get_asset))
        .route("/api/v1/transfer-events", get(get_transfer_events));
    if enable_websocket {
        router = router.route("/api/v1/ws", get(ws_handler));
    }
    let router = router.with_state(state).layer(TraceLayer::new_for_http());

    // Add CORS if enabled
    if enable_cors {
        router.layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
    } else {
        router
    }
}

/// Health check endpoint
async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("OK"))
}

/// Sign up without a wallet
async fn create_user(State(api_state): State<ApiState>, Json(request): Json<CreateUserRequest>) -> ApiResult<User> {
    Ok(Json(ApiResponse::success(api_state.accounts.create_user(&request.username)?)))
}

async fn get_balance(State(api_state): State<ApiState>, Path(user_id): Path<AccountId>) -> ApiResult<BalanceInfo> {
    api_state.accounts.get_user(&user_id)?;
    let balance = api_state.transactor.balance(&user_id)?;
    Ok(Json(ApiResponse::success(BalanceInfo {
        user_id,
        balance: balance.to_string(),
        sups: format_sups(balance),
    })))
}

/// Newest first
async fn get_transactions(
    State(api_state): State<ApiState>,
    Path(user_id): Path<AccountId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<Transaction>> {
    api_state.accounts.get_user(&user_id)?;
    let transactions = api_state
        .transactor
        .store()
        .list_transactions_for_account(&user_id, page(query.limit))?;
    Ok(Json(ApiResponse::success(transactions)))
}

async fn get_withdrawals(
    State(api_state): State<ApiState>,
    Path(user_id): Path<AccountId>,
) -> ApiResult<Vec<PendingRefund>> {
    api_state.accounts.get_user(&user_id)?;
    Ok(Json(ApiResponse::success(api_state.escrow.list_for_user(&user_id)?)))
}

async fn get_user_assets(
    State(api_state): State<ApiState>,
    Path(user_id): Path<AccountId>,
) -> ApiResult<Vec<UserAsset>> {
    api_state.accounts.get_user(&user_id)?;
    Ok(Json(ApiResponse::success(api_state.assets.list_by_owner(&user_id)?)))
}

/// Hold SUPS for an on-chain withdrawal
async fn withdraw(State(api_state): State<ApiState>, Json(request): Json<WithdrawRequest>) -> ApiResult<PendingRefund> {
    api_state.accounts.get_user(&request.user_id)?;
    let amount = parse_positive_amount(&request.amount)?;
    let hold = api_state.escrow.hold_withdrawal(&request.user_id, amount)?;
    Ok(Json(ApiResponse::success(hold)))
}

/// Announce a deposit before the indexer has seen it
async fn register_deposit(
    State(api_state): State<ApiState>,
    Json(request): Json<DepositRequest>,
) -> ApiResult<DepositTransaction> {
    api_state.accounts.get_user(&request.user_id)?;
    let amount = parse_positive_amount(&request.amount)?;
    let deposit = api_state
        .reconciler
        .register_pending_deposit(&request.user_id, &request.tx_hash, amount)?;
    Ok(Json(ApiResponse::success(deposit)))
}

async fn get_asset(State(api_state): State<ApiState>, Path(hash): Path<String>) -> ApiResult<UserAsset> {
    Ok(Json(ApiResponse::success(api_state.assets.get_by_hash(&hash)?)))
}

/// Transfer events with id greater than `from`
async fn get_transfer_events(
    State(api_state): State<ApiState>,
    Query(query): Query<TransferEventsQuery>,
) -> ApiResult<Vec<AssetTransferEvent>> {
    let events = api_state.assets.transfer_events_since(query.from, page(query.limit))?;
    Ok(Json(ApiResponse::success(events)))
}

/// WebSocket handler
async fn ws_handler(ws: WebSocketUpgrade, State(api_state): State<ApiState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, api_state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: axum::extract::ws::WebSocket, state: ApiState) {
    use futures_util::{SinkExt, StreamExt};
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ws_tx.subscribe();
    let subscriptions = Arc::new(tokio::sync::Mutex::new(Vec::<WsSubscription>::new()));

    let subscriptions_send = Arc::clone(&subscriptions);
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client lagging, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            // Nothing is sent until the client subscribes
            let subs = subscriptions_send.lock().await;
            let should_send = subs.iter().any(|sub| sub.matches(&event));
            drop(subs);

            if should_send {
                if let Ok(json) = serde_json::to_string(&event) {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let subscriptions_recv = Arc::clone(&subscriptions);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(request) = serde_json::from_str::<WsSubscribeRequest>(&text) {
                    let mut subs = subscriptions_recv.lock().await;
                    *subs = request.subscribe;
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
}

/// Start API server
pub async fn start_api_server(state: ApiState) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let listen_addr = state.config.api.listen_addr.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("API server listening on http://{}", listen_addr);
    tracing::info!("Health check: http://{}/health", listen_addr);
    tracing::info!("WebSocket: ws://{}/api/v1/ws", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
