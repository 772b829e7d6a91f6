//! NFT ownership and on-chain status sync
//!
//! For every tracked collection the latest transfer of each token decides
//! who owns it on chain and whether it is staked. Owner drift and status
//! drift are corrected independently, so a re-run over unchanged chain data
//! does nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountDirectory;
use crate::assets::AssetEngine;
use crate::error::Result;
use crate::health::IndexerHealth;
use crate::indexer::{EventSource, NftOwnerRecord};
use crate::store::LedgerStore;
use crate::types::{normalize_address, Collection, OnChainStatus};

/// `initiated_from` label of ownership corrections made by this sync
pub const ON_CHAIN_INITIATOR: &str = "ON_CHAIN";

/// Holder of burned tokens
pub const BURN_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// On-chain state of one token
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerStatus {
    pub owner_address: String,
    pub status: OnChainStatus,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct NftSyncReport {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn matches_contract(address: &str, contract: Option<&String>) -> bool {
    contract
        .map(|c| !c.trim().is_empty() && normalize_address(c) == address)
        .unwrap_or(false)
}

/// Reduce owner records to the latest state per token id.
///
/// A token held by a staking contract belongs to whoever sent it there.
pub fn owner_statuses(records: &[NftOwnerRecord], collection: &Collection) -> BTreeMap<u64, OwnerStatus> {
    let mut latest: BTreeMap<u64, &NftOwnerRecord> = BTreeMap::new();
    for record in records {
        let newer = latest
            .get(&record.token_id)
            .map_or(true, |cur| (record.block_number, record.log_index) > (cur.block_number, cur.log_index));
        if newer {
            latest.insert(record.token_id, record);
        }
    }

    latest
        .into_iter()
        .map(|(token_id, record)| {
            let to = normalize_address(&record.to_address);
            let (owner_address, status) = if matches_contract(&to, collection.stake_contract.as_ref()) {
                (normalize_address(&record.from_address), OnChainStatus::Unstakable)
            } else if matches_contract(&to, collection.staking_contract_old.as_ref()) {
                (normalize_address(&record.from_address), OnChainStatus::UnstakableOld)
            } else {
                (to, OnChainStatus::Stakable)
            };
            (
                token_id,
                OwnerStatus {
                    owner_address,
                    status,
                    tx_hash: record.tx_hash.clone(),
                    block_number: record.block_number,
                },
            )
        })
        .collect()
}

pub struct NftSync {
    source: Arc<dyn EventSource>,
    store: LedgerStore,
    assets: Arc<AssetEngine>,
    accounts: Arc<AccountDirectory>,
    health: Arc<IndexerHealth>,
}

impl NftSync {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: LedgerStore,
        assets: Arc<AssetEngine>,
        accounts: Arc<AccountDirectory>,
        health: Arc<IndexerHealth>,
    ) -> Self {
        Self {
            source,
            store,
            assets,
            accounts,
            health,
        }
    }

    pub async fn sync_all(&self) -> Result<NftSyncReport> {
        let mut total = NftSyncReport::default();
        for collection in self.store.list_collections()? {
            let report = self.sync_collection(&collection).await?;
            info!(
                collection = %collection.slug,
                updated = report.updated,
                skipped = report.skipped,
                failed = report.failed,
                "Synced nft ownerships"
            );
            total.updated += report.updated;
            total.skipped += report.skipped;
            total.failed += report.failed;
        }
        Ok(total)
    }

    pub async fn sync_collection(&self, collection: &Collection) -> Result<NftSyncReport> {
        let records = self
            .health
            .observe(self.source.nft_owners(&collection.mint_contract).await)?;
        let statuses = owner_statuses(&records, collection);
        debug!(collection = %collection.slug, records = statuses.len(), "Processing NFT owners");

        let mut report = NftSyncReport::default();
        for (token_id, status) in &statuses {
            match self.reconcile_token(collection, *token_id, status) {
                Ok(0) => report.skipped += 1,
                Ok(changes) => report.updated += changes,
                Err(e) => {
                    error!(collection = %collection.slug, token_id, error = %e, "Failed to reconcile NFT");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Returns the number of corrections applied
    fn reconcile_token(&self, collection: &Collection, token_id: u64, status: &OwnerStatus) -> Result<usize> {
        let Some(asset) = self.store.get_asset_by_token(&collection.id, token_id)? else {
            debug!(collection = %collection.slug, token_id, "Item not found");
            return Ok(0);
        };
        if status.owner_address == BURN_ADDRESS {
            debug!(asset_hash = %asset.hash, tx_hash = %status.tx_hash, "Token burned, leaving record as is");
            return Ok(0);
        }
        let mut changes = 0;

        let on_chain_owner = self.accounts.create_or_get_user_by_address(&status.owner_address)?;
        if on_chain_owner.id != asset.owner_id {
            if let Some(service) = &asset.locked_to_service {
                warn!(
                    asset_hash = %asset.hash,
                    service = %service,
                    on_chain_owner = %on_chain_owner.id,
                    "Owner drift on a service-locked asset, leaving for the service"
                );
            } else {
                self.assets.transfer_initiated_by(
                    &asset.hash,
                    &asset.owner_id,
                    &on_chain_owner.id,
                    None,
                    ON_CHAIN_INITIATOR,
                    None,
                )?;
                info!(asset_hash = %asset.hash, new_owner = %on_chain_owner.id, tx_hash = %status.tx_hash, "Set new nft owner");
                changes += 1;
            }
        }

        if asset.on_chain_status != status.status {
            self.assets.set_on_chain_status(&asset.hash, status.status)?;
            debug!(asset_hash = %asset.hash, from = ?asset.on_chain_status, to = ?status.status, "Set new nft status");
            changes += 1;
        }
        Ok(changes)
    }
}
