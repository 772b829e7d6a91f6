//! Asset Transfer Engine
//!
//! Ownership transfer and service locks for non-fungible assets:
//! - a transfer moves the owner and appends a transfer event atomically
//! - an asset locked to a service can only be moved by that service
//! - locking is idempotent for the holding service

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CollectionConfig;
use crate::error::{PassportError, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::store::LedgerStore;
use crate::types::{
    hex_prefix, sha256, AccountId, AssetTransferEvent, Collection, LifecycleState, OnChainStatus, TransactionId,
    UserAsset,
};

/// Service name recorded for transfers not initiated by a service
pub const XSYN_SERVICE: &str = "XSYN";

/// Parameters for registering a new asset
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub collection_id: Uuid,
    pub token_id: u64,
    pub owner_id: AccountId,
    pub name: String,
    pub hash: Option<String>,
    pub on_chain_status: OnChainStatus,
    pub locked_to_service: Option<String>,
}

pub struct AssetEngine {
    store: LedgerStore,
    events: EventBus,
}

impl AssetEngine {
    pub fn new(store: LedgerStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Register an asset. The hash defaults to a digest of collection and token.
    pub fn register(&self, new: NewAsset) -> Result<UserAsset> {
        let hash = match new.hash {
            Some(hash) if !hash.trim().is_empty() => hash.trim().to_string(),
            _ => {
                let mut seed = new.collection_id.as_bytes().to_vec();
                seed.extend_from_slice(&new.token_id.to_be_bytes());
                hex_prefix(&sha256(&seed), 10)
            }
        };
        let now = Utc::now();
        let asset = UserAsset {
            id: Uuid::new_v4(),
            collection_id: new.collection_id,
            token_id: new.token_id,
            hash,
            owner_id: new.owner_id,
            locked_to_service: new.locked_to_service,
            on_chain_status: new.on_chain_status,
            name: new.name,
            state: LifecycleState::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_asset(&asset)?;
        info!(asset_hash = %asset.hash, owner = %asset.owner_id, token_id = asset.token_id, "Asset registered");
        Ok(asset)
    }

    pub fn get_by_hash(&self, hash: &str) -> Result<UserAsset> {
        self.store
            .get_asset_by_hash(hash)?
            .filter(|a| a.state.is_active())
            .ok_or_else(|| PassportError::NotFound(format!("asset {}", hash)))
    }

    pub fn list_by_owner(&self, owner: &AccountId) -> Result<Vec<UserAsset>> {
        self.store.list_assets_by_owner(owner)
    }

    /// Move an asset from `from` to `to`.
    ///
    /// # Arguments
    /// * `service_id` - the calling service, `None` for a user-initiated transfer
    /// * `related_tx` - ledger transaction that paid for the transfer, if any
    ///
    /// # Returns
    /// The updated asset and the id of the transfer event.
    ///
    /// # Errors
    /// `NotFound` if `from` does not own the asset or `to` is not an active
    /// user, `Forbidden` if the asset is locked to a service other than
    /// `service_id`.
    pub fn transfer(
        &self,
        hash: &str,
        from: &AccountId,
        to: &AccountId,
        service_id: Option<&str>,
        related_tx: Option<TransactionId>,
    ) -> Result<(UserAsset, u64)> {
        self.transfer_initiated_by(hash, from, to, service_id, service_id.unwrap_or(XSYN_SERVICE), related_tx)
    }

    /// Transfer with an explicit `initiated_from` label, used by chain sync
    pub(crate) fn transfer_initiated_by(
        &self,
        hash: &str,
        from: &AccountId,
        to: &AccountId,
        service_id: Option<&str>,
        initiated_from: &str,
        related_tx: Option<TransactionId>,
    ) -> Result<(UserAsset, u64)> {
        if from == to {
            return Err(PassportError::InvalidInput("asset already owned by recipient".into()));
        }
        if !self.store.get_user(to)?.is_some_and(|u| u.state.is_active()) {
            warn!(asset_hash = hash, to = %to, "Asset transfer to unknown user rejected");
            return Err(PassportError::NotFound(format!("user {}", to)));
        }
        let event = AssetTransferEvent {
            id: 0,
            asset_id: Uuid::nil(),
            asset_hash: hash.to_string(),
            from_user: *from,
            to_user: *to,
            initiated_from: initiated_from.to_string(),
            related_transaction_id: related_tx,
            transferred_at: Utc::now(),
        };

        let result = self.store.transfer_asset_with_event(hash, event, |asset| {
            if asset.owner_id != *from {
                return Err(PassportError::NotFound(format!("asset {} not owned by {}", hash, from)));
            }
            match (&asset.locked_to_service, service_id) {
                (Some(holder), Some(caller)) if holder == caller => Ok(()),
                (Some(_), _) => Err(PassportError::Forbidden(
                    "cannot transfer an asset the service doesn't control".into(),
                )),
                (None, _) => Ok(()),
            }
        });

        let (asset, event) = match result {
            Ok(done) => done,
            Err(e) => {
                warn!(asset_hash = hash, from = %from, to = %to, service = ?service_id, error = %e, "Asset transfer rejected");
                return Err(e);
            }
        };

        info!(asset_hash = hash, from = %from, to = %to, event_id = event.id, "Asset transferred");
        let event_id = event.id;
        self.events.publish(&LedgerEvent::AssetTransferred {
            asset: asset.clone(),
            event,
        });
        Ok((asset, event_id))
    }

    /// Lock an asset to `service_id`. Succeeds without change if that service
    /// already holds the lock.
    pub fn lock_to_service(&self, hash: &str, owner: &AccountId, service_id: &str) -> Result<UserAsset> {
        let before = self.get_by_hash(hash)?;
        let asset = self.store.update_asset(hash, |asset| {
            if asset.owner_id != *owner {
                return Err(PassportError::NotFound(format!("asset {} not owned by {}", hash, owner)));
            }
            match &asset.locked_to_service {
                Some(holder) if holder == service_id => Ok(()),
                Some(_) => Err(PassportError::Forbidden("asset is locked to a different service".into())),
                None => {
                    asset.locked_to_service = Some(service_id.to_string());
                    Ok(())
                }
            }
        })?;
        if before.locked_to_service.is_none() {
            info!(asset_hash = hash, service = service_id, "Asset locked to service");
            self.events.publish(&LedgerEvent::AssetLockChanged { asset: asset.clone() });
        }
        Ok(asset)
    }

    /// Release the lock held by `service_id`
    pub fn unlock_from_service(&self, hash: &str, service_id: &str) -> Result<UserAsset> {
        let asset = self.store.update_asset(hash, |asset| match &asset.locked_to_service {
            None => Err(PassportError::Conflict("asset is not locked".into())),
            Some(holder) if holder != service_id => {
                Err(PassportError::Forbidden("asset is locked to a different service".into()))
            }
            Some(_) => {
                asset.locked_to_service = None;
                Ok(())
            }
        })?;
        info!(asset_hash = hash, service = service_id, "Asset unlocked from service");
        self.events.publish(&LedgerEvent::AssetLockChanged { asset: asset.clone() });
        Ok(asset)
    }

    pub fn set_on_chain_status(&self, hash: &str, status: OnChainStatus) -> Result<UserAsset> {
        let before = self.get_by_hash(hash)?;
        let asset = self.store.update_asset(hash, |asset| {
            asset.on_chain_status = status;
            Ok(())
        })?;
        if before.on_chain_status != status {
            info!(asset_hash = hash, from = ?before.on_chain_status, to = ?status, "Asset on-chain status changed");
            self.events.publish(&LedgerEvent::AssetStatusChanged { asset: asset.clone() });
        }
        Ok(asset)
    }

    /// Create or update a tracked collection, keyed by slug
    pub fn upsert_collection(&self, config: &CollectionConfig) -> Result<Collection> {
        let id = self
            .store
            .list_collections()?
            .into_iter()
            .find(|c| c.slug == config.slug)
            .map(|c| c.id)
            .unwrap_or_else(Uuid::new_v4);
        let collection = Collection {
            id,
            slug: config.slug.clone(),
            mint_contract: config.mint_contract.clone(),
            stake_contract: config.stake_contract.clone(),
            staking_contract_old: config.staking_contract_old.clone(),
        };
        self.store.put_collection(&collection)?;
        Ok(collection)
    }

    /// Transfer events with id greater than `after`, oldest first
    pub fn transfer_events_since(&self, after: u64, limit: usize) -> Result<Vec<AssetTransferEvent>> {
        self.store.transfer_events_since(after, limit)
    }
}
