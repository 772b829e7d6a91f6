//! Configuration for the passport service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{PassportError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "passport_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API server listen address
    pub listen_addr: String,

    /// Enable CORS
    pub enable_cors: bool,

    /// Enable WebSocket support
    pub enable_websocket: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,

    /// API configuration
    pub api: ApiConfig,

    /// Internal RPC configuration
    pub rpc: RpcConfig,

    /// Upstream indexer configuration
    pub indexer: IndexerConfig,

    /// Background sync configuration
    pub sync: SyncConfig,

    /// Outbound game server client configuration
    pub game_server: GameServerConfig,

    /// Ledger configuration
    pub ledger: LedgerConfig,

    /// Logging level
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path
    pub db_path: PathBuf,

    /// Load every balance into the cache at startup
    pub warm_balance_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// RPC server listen address
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub slug: String,
    pub mint_contract: String,
    pub stake_contract: Option<String>,
    pub staking_contract_old: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Base URL of the indexer HTTP API
    pub base_url: String,

    /// Query the testnet feeds
    pub testnet: bool,

    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,

    /// Deposits sent from this contract are purchases, not deposits
    pub purchase_contract: String,

    /// NFT collections tracked by the ownership sync
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between sync ticks (seconds)
    pub tick_interval_secs: u64,

    /// Upper bound on a single sync run (seconds)
    pub batch_timeout_secs: u64,

    /// Withdraw signature validity (seconds)
    pub withdraw_expiry_secs: i64,

    /// Extra time after signature expiry before an escrow may be reversed (seconds)
    pub refund_grace_secs: i64,

    /// Consecutive indexer failures that disable automatic rollback
    pub failure_threshold: u64,

    /// Consecutive indexer successes that re-enable automatic rollback
    pub success_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameServerConfig {
    /// Game server RPC endpoints (round-robin)
    pub addrs: Vec<String>,

    /// API key presented to the game server
    pub api_key: String,

    /// Maximum attempts per call on transport failure
    pub max_attempts: u32,

    /// Initial backoff (ms)
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (ms)
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Additional accounts permitted to hold a negative balance (mint/burn)
    pub allow_negative: Vec<uuid::Uuid>,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load() -> Result<Self> {
        let default_config = Self::default();

        let config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Save default config
            let content = serde_json::to_string_pretty(&default_config)
                .map_err(|e| PassportError::Config(format!("Failed to serialize config: {}", e)))?;
            std::fs::write(&config_path, content)
                .map_err(|e| PassportError::Config(format!("Failed to write config: {}", e)))?;
            Ok(default_config)
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PassportError::Config(format!("Failed to read config: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| PassportError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn default() -> Self {
        Self {
            storage: StorageConfig {
                db_path: PathBuf::from("./passport_db"),
                warm_balance_cache: true,
            },
            api: ApiConfig {
                listen_addr: "127.0.0.1:8086".to_string(),
                enable_cors: true,
                enable_websocket: true,
            },
            rpc: RpcConfig {
                listen_addr: "127.0.0.1:10001".to_string(),
            },
            indexer: IndexerConfig {
                base_url: "http://v3.supremacy-api.avantdata.com:3001".to_string(),
                testnet: false,
                request_timeout_secs: 15,
                purchase_contract: "0x52b38626D3167e5357FE7348624352B7062fE271".to_string(),
                collections: vec![],
            },
            sync: SyncConfig {
                tick_interval_secs: 20,
                batch_timeout_secs: 120,
                withdraw_expiry_secs: 5 * 60,
                refund_grace_secs: 10 * 60,
                failure_threshold: 5,
                success_threshold: 10,
            },
            game_server: GameServerConfig {
                addrs: vec!["http://127.0.0.1:10011".to_string()],
                api_key: String::new(),
                max_attempts: 6,
                initial_backoff_ms: 1000,
                max_backoff_ms: 10_000,
            },
            ledger: LedgerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}
