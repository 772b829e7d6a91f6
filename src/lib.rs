//! Passport: custodial SUPS ledger and asset registry
//!
//! Double-entry ledger for the SUPS token with an in-memory balance cache,
//! reconciliation against an external chain indexer, withdrawal escrow and
//! ownership tracking for game assets.

pub mod accounts;
pub mod api;
pub mod assets;
pub mod balance_cache;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod game_client;
pub mod health;
pub mod indexer;
pub mod kv;
pub mod nft_sync;
pub mod reconcile;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod transactor;
pub mod types;
pub mod ws_events;

// Re-export commonly used types
pub use accounts::AccountDirectory;
pub use assets::AssetEngine;
pub use balance_cache::BalanceCache;
pub use config::Config;
pub use error::{PassportError, Result};
pub use escrow::Escrow;
pub use events::{EventBus, LedgerEvent};
pub use store::LedgerStore;
pub use transactor::Transactor;
pub use types::{AccountId, SystemAccount, Transaction, TransactionId, TransferRequest};
