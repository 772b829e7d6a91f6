//! WebSocket event types for real-time notifications
//!
//! These payloads are broadcast to WebSocket clients when balances move or
//! assets change hands.

use serde::Serialize;

/// WebSocket event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsEvent {
    #[serde(rename = "balance_changed")]
    BalanceChanged {
        user_id: String,
        balance: String,
    },
    #[serde(rename = "transaction_committed")]
    TransactionCommitted {
        transaction_id: String,
        from: String,
        to: String,
        amount: String,
        group: String,
    },
    #[serde(rename = "asset_transferred")]
    AssetTransferred {
        asset_hash: String,
        from: String,
        to: String,
        event_id: u64,
    },
    #[serde(rename = "asset_lock_changed")]
    AssetLockChanged {
        asset_hash: String,
        owner: String,
        locked_to: Option<String>,
    },
    #[serde(rename = "withdrawal_reversed")]
    WithdrawalReversed {
        user_id: String,
        amount: String,
        reference: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl WsEvent {
    /// Subscription type name, matches the serde tag
    pub fn kind(&self) -> &'static str {
        match self {
            WsEvent::BalanceChanged { .. } => "balance_changed",
            WsEvent::TransactionCommitted { .. } => "transaction_committed",
            WsEvent::AssetTransferred { .. } => "asset_transferred",
            WsEvent::AssetLockChanged { .. } => "asset_lock_changed",
            WsEvent::WithdrawalReversed { .. } => "withdrawal_reversed",
            WsEvent::Error { .. } => "error",
        }
    }

    /// Users this event concerns
    pub fn involves_user(&self, user: &str) -> bool {
        match self {
            WsEvent::BalanceChanged { user_id, .. } | WsEvent::WithdrawalReversed { user_id, .. } => user_id == user,
            WsEvent::TransactionCommitted { from, to, .. } | WsEvent::AssetTransferred { from, to, .. } => {
                from == user || to == user
            }
            WsEvent::AssetLockChanged { owner, .. } => owner == user,
            WsEvent::Error { .. } => false,
        }
    }

    pub fn asset_hash(&self) -> Option<&str> {
        match self {
            WsEvent::AssetTransferred { asset_hash, .. } | WsEvent::AssetLockChanged { asset_hash, .. } => {
                Some(asset_hash)
            }
            _ => None,
        }
    }
}
