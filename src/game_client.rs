//! Outbound RPC client for the game server
//!
//! Connections come from a round-robin [`ConnectionPool`]; retries are the
//! job of a separate [`RetryPolicy`]. Only transport failures are retried.
//! An error answered by the game server is returned at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::config::GameServerConfig;
use crate::error::{PassportError, Result};
use crate::events::{EventSubscriber, LedgerEvent};
use crate::types::{AssetTransferEvent, OnChainStatus, UserAsset};

/// Why a single call attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Connection refused, reset, timed out or garbled reply
    Transport(String),
    /// The game server processed the call and rejected it
    Application(String),
}

/// Bounded exponential backoff for transport failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &GameServerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor).min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, method: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, CallError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(CallError::Application(msg)) => {
                    return Err(PassportError::Conflict(msg));
                }
                Err(CallError::Transport(msg)) if attempt >= self.max_attempts => {
                    error!(method, attempts = attempt, error = %msg, "Game server call retry exceeded");
                    return Err(PassportError::UpstreamUnavailable(format!(
                        "call {} failed after {} attempts: {}",
                        method, attempt, msg
                    )));
                }
                Err(CallError::Transport(msg)) => {
                    let delay = self.backoff(attempt);
                    warn!(method, attempt, delay_ms = delay.as_millis() as u64, error = %msg, "Game server call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// One pooled connection. A broken slot is redialed on its next checkout.
pub struct Lease {
    slot: usize,
    addr: String,
    client: Client,
}

struct Slot {
    addr: String,
    client: Mutex<Option<Client>>,
}

pub struct ConnectionPool {
    slots: Vec<Slot>,
    next: AtomicUsize,
    request_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(addrs: &[String], request_timeout: Duration) -> Result<Self> {
        if addrs.is_empty() {
            return Err(PassportError::Config("no game server address set".into()));
        }
        Ok(Self {
            slots: addrs
                .iter()
                .map(|addr| Slot {
                    addr: addr.trim_end_matches('/').to_string(),
                    client: Mutex::new(None),
                })
                .collect(),
            next: AtomicUsize::new(0),
            request_timeout,
        })
    }

    pub fn checkout(&self) -> std::result::Result<Lease, CallError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let entry = &self.slots[slot];
        let mut guard = entry.client.lock();
        let client = match guard.as_ref() {
            Some(client) => client.clone(),
            None => {
                debug!(addr = %entry.addr, "Dialing game server");
                let client = Client::builder()
                    .timeout(self.request_timeout)
                    .build()
                    .map_err(|e| CallError::Transport(e.to_string()))?;
                *guard = Some(client.clone());
                client
            }
        };
        Ok(Lease {
            slot,
            addr: entry.addr.clone(),
            client,
        })
    }

    /// Return a lease; a broken one drops the slot's client
    pub fn checkin(&self, lease: Lease, healthy: bool) {
        if !healthy {
            *self.slots[lease.slot].client.lock() = None;
        }
    }
}

#[derive(Deserialize)]
struct RpcReply {
    result: Option<Value>,
    error: Option<String>,
}

pub struct GameClient {
    pool: ConnectionPool,
    retry: RetryPolicy,
    api_key: String,
}

impl GameClient {
    pub fn new(config: &GameServerConfig) -> Result<Self> {
        Ok(Self::with_parts(
            ConnectionPool::new(&config.addrs, Duration::from_secs(10))?,
            RetryPolicy::from_config(config),
            config.api_key.clone(),
        ))
    }

    pub fn with_parts(pool: ConnectionPool, retry: RetryPolicy, api_key: impl Into<String>) -> Self {
        Self {
            pool,
            retry,
            api_key: api_key.into(),
        }
    }

    async fn attempt(&self, body: &Value) -> std::result::Result<Value, CallError> {
        let lease = self.pool.checkout()?;
        let url = format!("{}/rpc", lease.addr);
        let response = match lease.client.post(&url).json(body).send().await {
            Ok(response) => response,
            Err(e) => {
                self.pool.checkin(lease, false);
                return Err(CallError::Transport(e.to_string()));
            }
        };
        let status = response.status();
        let reply = match response.json::<RpcReply>().await {
            Ok(reply) => reply,
            Err(e) => {
                self.pool.checkin(lease, false);
                return Err(CallError::Transport(format!("status {}: {}", status.as_u16(), e)));
            }
        };
        self.pool.checkin(lease, true);

        match (reply.error, reply.result) {
            (Some(msg), _) => Err(CallError::Application(msg)),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }

    /// Call `method` with `params`, adding the api key
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let mut params = serde_json::to_value(params)?;
        if let Value::Object(map) = &mut params {
            map.insert("api_key".into(), Value::String(self.api_key.clone()));
        }
        let body = json!({ "method": method, "params": params });

        let result = self.retry.run(method, || self.attempt(&body)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Tell the game server an asset changed hands. Returns the hashes of
    /// any other assets it moved along with it.
    pub async fn asset_transferred(&self, event: &AssetTransferEvent) -> Result<Vec<String>> {
        #[derive(Deserialize, Default)]
        struct Reply {
            #[serde(default)]
            other_transferred_asset_hashes: Vec<String>,
        }
        let reply: Option<Reply> = self
            .call("AssetTransferred", &json!({ "transfer_event": event }))
            .await?;
        Ok(reply.unwrap_or_default().other_transferred_asset_hashes)
    }

    pub async fn asset_lock_to_supremacy(&self, asset: &UserAsset, transfer_event_id: u64, market_locked: bool) -> Result<()> {
        let _: Value = self
            .call(
                "AssetLockToSupremacy",
                &json!({
                    "owner_id": asset.owner_id,
                    "hash": asset.hash,
                    "transfer_event_id": transfer_event_id,
                    "market_locked": market_locked,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn asset_unlock_from_supremacy(&self, asset: &UserAsset, transfer_event_id: u64) -> Result<()> {
        let _: Value = self
            .call(
                "AssetUnlockFromSupremacy",
                &json!({
                    "owner_id": asset.owner_id,
                    "hash": asset.hash,
                    "transfer_event_id": transfer_event_id,
                }),
            )
            .await?;
        Ok(())
    }
}

/// Forwards asset transfers and staking changes to the game server on a
/// spawned task, so no ledger lock is held across the network call.
///
/// A staked asset is locked in the game (market locked when staked on the
/// old contract); an unstaked one is released.
pub struct GameServerNotifier {
    client: Arc<GameClient>,
    runtime: Handle,
}

impl GameServerNotifier {
    pub fn new(client: Arc<GameClient>, runtime: Handle) -> Self {
        Self { client, runtime }
    }
}

impl EventSubscriber for GameServerNotifier {
    fn name(&self) -> &'static str {
        "game_server"
    }

    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::AssetTransferred { event, .. } => {
                let client = self.client.clone();
                let event = event.clone();
                self.runtime.spawn(async move {
                    if let Err(e) = client.asset_transferred(&event).await {
                        error!(asset_hash = %event.asset_hash, event_id = event.id, error = %e, "Failed to notify game server of transfer");
                    }
                });
            }
            LedgerEvent::AssetStatusChanged { asset } => {
                let client = self.client.clone();
                let asset = asset.clone();
                self.runtime.spawn(async move {
                    let result = match asset.on_chain_status {
                        OnChainStatus::Stakable => client.asset_unlock_from_supremacy(&asset, 0).await,
                        OnChainStatus::Unstakable => client.asset_lock_to_supremacy(&asset, 0, false).await,
                        OnChainStatus::UnstakableOld => client.asset_lock_to_supremacy(&asset, 0, true).await,
                        OnChainStatus::Mintable => Ok(()),
                    };
                    if let Err(e) = result {
                        error!(asset_hash = %asset.hash, status = ?asset.on_chain_status, error = %e, "Failed to notify game server of staking change");
                    }
                });
            }
            _ => {}
        }
    }
}
