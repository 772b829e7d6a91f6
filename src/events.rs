//! Domain events and their subscribers
//!
//! The transactor, the asset engine and the escrow publish a [`LedgerEvent`]
//! after each durable commit. Subscribers are called in registration order on
//! the publishing thread, after every lock has been released, so they must
//! return quickly and push slow work onto a task.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{AssetTransferEvent, PendingRefund, SystemAccount, Transaction, TransactionId, UserAsset};
use crate::ws_events::WsEvent;

#[derive(Debug, Clone)]
pub enum LedgerEvent {
    TransactionCommitted {
        transaction: Transaction,
        from_balance: Decimal,
        to_balance: Decimal,
    },
    AssetTransferred {
        asset: UserAsset,
        event: AssetTransferEvent,
    },
    AssetLockChanged {
        asset: UserAsset,
    },
    /// Staking state observed on chain changed
    AssetStatusChanged {
        asset: UserAsset,
    },
    WithdrawalReversed {
        refund: PendingRefund,
        transaction_id: TransactionId,
    },
}

pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_event(&self, event: &LedgerEvent);
}

/// Ordered list of subscribers, built once at startup
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn publish(&self, event: &LedgerEvent) {
        for subscriber in &self.subscribers {
            debug!(subscriber = subscriber.name(), "Dispatching ledger event");
            subscriber.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// Maps ledger events onto WebSocket payloads. System accounts are not
/// broadcast.
pub struct BroadcastSubscriber {
    tx: broadcast::Sender<WsEvent>,
}

impl BroadcastSubscriber {
    pub fn new(tx: broadcast::Sender<WsEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: WsEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl EventSubscriber for BroadcastSubscriber {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::TransactionCommitted { transaction, from_balance, to_balance } => {
                self.send(WsEvent::TransactionCommitted {
                    transaction_id: transaction.id.to_string(),
                    from: transaction.from_account.to_string(),
                    to: transaction.to_account.to_string(),
                    amount: transaction.amount.to_string(),
                    group: transaction.group.clone(),
                });
                for (account, balance) in [
                    (transaction.from_account, from_balance),
                    (transaction.to_account, to_balance),
                ] {
                    if !SystemAccount::is_system(&account) {
                        self.send(WsEvent::BalanceChanged {
                            user_id: account.to_string(),
                            balance: balance.to_string(),
                        });
                    }
                }
            }
            LedgerEvent::AssetTransferred { asset, event } => {
                self.send(WsEvent::AssetTransferred {
                    asset_hash: asset.hash.clone(),
                    from: event.from_user.to_string(),
                    to: event.to_user.to_string(),
                    event_id: event.id,
                });
            }
            LedgerEvent::AssetLockChanged { asset } => {
                self.send(WsEvent::AssetLockChanged {
                    asset_hash: asset.hash.clone(),
                    owner: asset.owner_id.to_string(),
                    locked_to: asset.locked_to_service.clone(),
                });
            }
            LedgerEvent::AssetStatusChanged { .. } => {}
            LedgerEvent::WithdrawalReversed { refund, .. } => {
                self.send(WsEvent::WithdrawalReversed {
                    user_id: refund.user_id.to_string(),
                    amount: refund.amount.to_string(),
                    reference: refund.transaction_reference.clone(),
                });
            }
        }
    }
}
