//! Passport service binary
//!
//! Wires the ledger, the reconciliation pipelines and the two HTTP surfaces
//! together and runs them until Ctrl+C.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use passport::api::{start_api_server, ApiState};
use passport::events::BroadcastSubscriber;
use passport::game_client::{GameClient, GameServerNotifier};
use passport::health::IndexerHealth;
use passport::indexer::{EventSource, IndexerClient};
use passport::kv::KvStore;
use passport::nft_sync::NftSync;
use passport::reconcile::Reconciler;
use passport::rpc::{start_rpc_server, RpcState};
use passport::scheduler::SyncScheduler;
use passport::types::ApiKeyType;
use passport::ws_events::WsEvent;
use passport::{
    AccountDirectory, AssetEngine, BalanceCache, Config, Escrow, EventBus, LedgerStore, SystemAccount, Transactor,
};

#[tokio::main]
async fn main() -> Result<()> {
    // `passport [config]` serves, `passport issue-api-key <service_id> [config]`
    // prints a new SERVER_CLIENT key and exits
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (issue_key_for, config_path) = match args.first().map(String::as_str) {
        Some("issue-api-key") => {
            let service_id = args
                .get(1)
                .cloned()
                .context("usage: passport issue-api-key <service_id> [config]")?;
            (Some(service_id), args.get(2))
        }
        _ => (None, args.first()),
    };

    // Load configuration
    let config = match config_path {
        Some(path) => Config::load_from(&PathBuf::from(path))?,
        None => Config::load()?,
    };

    // Initialize logging, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("═══════════════════════════════════════════════════════════");
    info!("  Passport - SUPS ledger and asset registry");
    info!("═══════════════════════════════════════════════════════════");
    info!("  Database: {:?}", config.storage.db_path);
    info!("  API listen: {}", config.api.listen_addr);
    info!("  RPC listen: {}", config.rpc.listen_addr);

    let store = LedgerStore::new(&config).context("opening ledger store")?;
    let kv = KvStore::new(store.clone());

    // Mint/burn accounts may go negative
    let mut allow_negative: HashSet<_> = [SystemAccount::OnChain.id(), SystemAccount::XsynSale.id()].into();
    allow_negative.extend(config.ledger.allow_negative.iter().copied());
    let cache = Arc::new(BalanceCache::new(Arc::new(store.clone()), allow_negative));

    // Domain events: websocket broadcast, then the game server
    let (ws_tx, _) = broadcast::channel::<WsEvent>(1024);
    let mut events = EventBus::new().with_subscriber(Arc::new(BroadcastSubscriber::new(ws_tx.clone())));
    if config.game_server.addrs.is_empty() {
        warn!("No game server configured, asset transfers will not be forwarded");
    } else {
        let game_client = Arc::new(GameClient::new(&config.game_server)?);
        events = events.with_subscriber(Arc::new(GameServerNotifier::new(
            game_client,
            tokio::runtime::Handle::current(),
        )));
    }
    info!("✓ Event bus initialized with {} subscribers", events.len());

    let transactor = Arc::new(Transactor::new(store.clone(), cache, events.clone()));
    let accounts = Arc::new(AccountDirectory::new(store.clone(), transactor.clone(), kv.clone()));
    let assets = Arc::new(AssetEngine::new(store.clone(), events));
    let escrow = Arc::new(Escrow::new(transactor.clone(), &config.sync));

    accounts.seed_system_accounts()?;
    if let Some(service_id) = issue_key_for {
        let key = accounts.issue_api_key(&service_id, ApiKeyType::ServerClient)?;
        store.flush().await?;
        println!("{}", key);
        return Ok(());
    }
    for collection in &config.indexer.collections {
        let collection = assets.upsert_collection(collection)?;
        info!("  Tracking collection {} ({})", collection.slug, collection.mint_contract);
    }

    // Settle anything a crash left half-written before serving traffic
    let recovery = transactor.recover_pending()?;
    if !recovery.ambiguous.is_empty() {
        warn!(
            ambiguous = recovery.ambiguous.len(),
            "Pending transactions need operator review"
        );
    }
    if config.storage.warm_balance_cache {
        transactor.warm_cache()?;
    }
    info!("✓ Ledger ready");

    // Reconciliation
    let source: Arc<dyn EventSource> = Arc::new(IndexerClient::new(&config.indexer)?);
    let health = Arc::new(IndexerHealth::new(kv.clone(), &config.sync));
    let reconciler = Arc::new(Reconciler::new(
        source.clone(),
        transactor.clone(),
        accounts.clone(),
        escrow.clone(),
        health.clone(),
        kv.clone(),
        config.indexer.purchase_contract.clone(),
    ));
    let nft_sync = Arc::new(NftSync::new(source, store.clone(), assets.clone(), accounts.clone(), health));
    let scheduler = Arc::new(SyncScheduler::new(reconciler.clone(), nft_sync, kv, &config.sync));
    info!("✓ Sync scheduler initialized");
    info!("  Indexer: {}", config.indexer.base_url);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handles = scheduler.spawn(shutdown_rx);

    let api_state = ApiState {
        transactor: transactor.clone(),
        accounts: accounts.clone(),
        assets: assets.clone(),
        escrow,
        reconciler,
        config: config.clone(),
        ws_tx,
    };
    let rpc_state = RpcState {
        accounts,
        transactor,
        assets,
    };

    info!("═══════════════════════════════════════════════════════════");
    info!("  Passport is running!");
    info!("  API: http://{}/health", config.api.listen_addr);
    info!("  WebSocket: ws://{}/api/v1/ws", config.api.listen_addr);
    info!("  RPC: http://{}/rpc", config.rpc.listen_addr);
    info!("  Press Ctrl+C to shutdown");
    info!("═══════════════════════════════════════════════════════════");

    // Start API server in background
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state).await {
            error!("API server error: {}", e);
        }
    });

    // Start RPC server in background
    let rpc_addr = config.rpc.listen_addr.clone();
    let rpc_handle = tokio::spawn(async move {
        if let Err(e) = start_rpc_server(rpc_state, rpc_addr).await {
            error!("RPC server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down passport...");

    let _ = shutdown_tx.send(true);
    for handle in sync_handles {
        if let Err(e) = handle.await {
            error!("Sync task ended abnormally: {}", e);
        }
    }
    api_handle.abort();
    rpc_handle.abort();

    store.flush().await?;
    info!("Ledger flushed");

    Ok(())
}
