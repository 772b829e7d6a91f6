//! Ledger Store on sled
//!
//! Each logical table is a `sled::Tree` holding JSON rows. Writes that touch
//! more than one row go through a multi-tree transaction so that they are
//! applied all-or-nothing.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::{Db, Tree};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PassportError, Result};
use crate::types::{
    Account, AccountId, ApiKey, AssetTransferEvent, Collection, DepositTransaction, PendingRefund,
    Syndicate, Transaction, TransactionId, TxStatus, User, UserAsset,
};

/// Durable balance access used by the balance cache. Kept as a trait so the
/// cache can be exercised against a store that fails on demand.
pub trait BalanceStore: Send + Sync {
    /// `None` when the account does not exist
    fn load_balance(&self, account: &AccountId) -> Result<Option<Decimal>>;

    fn store_balance(&self, account: &AccountId, balance: Decimal) -> Result<()>;
}

/// Outcome of claiming a transaction reference
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The new row was written as PENDING and owns the reference
    Reserved,
    /// The reference already belongs to a PENDING or SUCCESS row
    Existing(Transaction),
}

#[derive(Clone)]
pub struct LedgerStore {
    db: Db,
    accounts: Tree,
    balances: Tree,
    transactions: Tree,
    tx_references: Tree,
    tx_by_account: Tree,
    refund_links: Tree,
    pending_refunds: Tree,
    users: Tree,
    user_addresses: Tree,
    syndicates: Tree,
    api_keys: Tree,
    collections: Tree,
    user_assets: Tree,
    asset_hashes: Tree,
    asset_tokens: Tree,
    transfer_events: Tree,
    sequences: Tree,
    deposit_transactions: Tree,
    kv: Tree,
}

const TRANSFER_EVENT_SEQ: &[u8] = b"transfer_events";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn abort<T>(e: PassportError) -> ConflictableTransactionResult<T, PassportError> {
    Err(ConflictableTransactionError::Abort(e))
}

fn tx_err(e: TransactionError<PassportError>) -> PassportError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => PassportError::from(e),
    }
}

fn account_index_key(account: &AccountId, tx: &Transaction) -> Vec<u8> {
    let nanos = tx.created_at.timestamp_nanos_opt().unwrap_or_default() as u64;
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(account.as_bytes());
    key.extend_from_slice(&nanos.to_be_bytes());
    key.extend_from_slice(tx.id.as_bytes());
    key
}

fn token_key(collection_id: &Uuid, token_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(collection_id.as_bytes());
    key.extend_from_slice(&token_id.to_be_bytes());
    key
}

fn uuid_from_ivec(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| PassportError::Serialization(format!("bad id: {}", e)))
}

impl LedgerStore {
    /// Open the store at the configured database path
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.storage.db_path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| PassportError::StorageFault(format!("Failed to open database: {}", e)))?;

        Ok(Self {
            accounts: db.open_tree("accounts")?,
            balances: db.open_tree("balances")?,
            transactions: db.open_tree("transactions")?,
            tx_references: db.open_tree("tx_references")?,
            tx_by_account: db.open_tree("tx_by_account")?,
            refund_links: db.open_tree("refund_links")?,
            pending_refunds: db.open_tree("pending_refunds")?,
            users: db.open_tree("users")?,
            user_addresses: db.open_tree("user_addresses")?,
            syndicates: db.open_tree("syndicates")?,
            api_keys: db.open_tree("api_keys")?,
            collections: db.open_tree("collections")?,
            user_assets: db.open_tree("user_assets")?,
            asset_hashes: db.open_tree("asset_hashes")?,
            asset_tokens: db.open_tree("asset_tokens")?,
            transfer_events: db.open_tree("transfer_events")?,
            sequences: db.open_tree("sequences")?,
            deposit_transactions: db.open_tree("deposit_transactions")?,
            kv: db.open_tree("kv")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    // ---- accounts ----

    /// Insert the account if absent. Returns false when it already existed.
    pub fn create_account(&self, account: &Account) -> Result<bool> {
        let value = encode(account)?;
        let swapped = self
            .accounts
            .compare_and_swap(account.id.as_bytes(), None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.accounts
            .get(id.as_bytes())?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.accounts.iter().values().map(|v| decode(&v?)).collect()
    }

    // ---- transactions ----

    /// Claim `tx.reference` and write `tx` as PENDING in one transaction.
    ///
    /// A reference held by a FAILED row is released to the new attempt.
    pub fn reserve_transaction(&self, tx: &Transaction) -> Result<Reservation> {
        let id = tx.id;
        let row = encode(tx)?;
        let from_key = account_index_key(&tx.from_account, tx);
        let to_key = account_index_key(&tx.to_account, tx);
        let reference = tx.reference.as_bytes();

        (&self.transactions, &self.tx_references, &self.tx_by_account)
            .transaction(|(txs, refs, by_account)| -> ConflictableTransactionResult<Reservation, PassportError> {
                if let Some(existing_id) = refs.get(reference)? {
                    let existing = match txs.get(&existing_id)? {
                        Some(bytes) => match decode::<Transaction>(&bytes) {
                            Ok(existing) => existing,
                            Err(e) => return abort(e),
                        },
                        None => {
                            return abort(PassportError::StorageFault(format!(
                                "reference '{}' points at a missing transaction",
                                tx.reference
                            )))
                        }
                    };
                    if existing.status != TxStatus::Failed {
                        return Ok(Reservation::Existing(existing));
                    }
                }
                txs.insert(&id.as_bytes()[..], row.clone())?;
                refs.insert(reference, id.as_bytes().to_vec())?;
                by_account.insert(from_key.clone(), id.as_bytes().to_vec())?;
                by_account.insert(to_key.clone(), id.as_bytes().to_vec())?;
                Ok(Reservation::Reserved)
            })
            .map_err(tx_err)
    }

    pub fn set_transaction_status(&self, id: &TransactionId, status: TxStatus) -> Result<Transaction> {
        let mut tx = self
            .get_transaction(id)?
            .ok_or_else(|| PassportError::NotFound(format!("transaction {}", id)))?;
        tx.status = status;
        self.transactions.insert(id.as_bytes(), encode(&tx)?)?;
        debug!(transaction_id = %id, ?status, "Transaction status updated");
        Ok(tx)
    }

    pub fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        self.transactions
            .get(id.as_bytes())?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn find_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        match self.tx_references.get(reference.as_bytes())? {
            Some(id) => self.get_transaction(&uuid_from_ivec(&id)?),
            None => Ok(None),
        }
    }

    /// True when a PENDING or SUCCESS row owns the reference
    pub fn reference_exists(&self, reference: &str) -> Result<bool> {
        Ok(self
            .find_by_reference(reference)?
            .is_some_and(|tx| tx.status != TxStatus::Failed))
    }

    /// Newest first
    pub fn list_transactions_for_account(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>> {
        let mut out = Vec::new();
        for entry in self.tx_by_account.scan_prefix(account.as_bytes()).rev() {
            let (_, id) = entry?;
            if let Some(tx) = self.get_transaction(&uuid_from_ivec(&id)?)? {
                out.push(tx);
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn list_transactions_with_status(&self, status: TxStatus) -> Result<Vec<Transaction>> {
        let mut out = Vec::new();
        for value in self.transactions.iter().values() {
            let tx: Transaction = decode(&value?)?;
            if tx.status == status {
                out.push(tx);
            }
        }
        Ok(out)
    }

    /// Balances implied by the SUCCESS rows alone
    pub fn replay_balances(&self) -> Result<HashMap<AccountId, Decimal>> {
        let mut balances: HashMap<AccountId, Decimal> = HashMap::new();
        for tx in self.list_transactions_with_status(TxStatus::Success)? {
            *balances.entry(tx.from_account).or_default() -= tx.amount;
            *balances.entry(tx.to_account).or_default() += tx.amount;
        }
        Ok(balances)
    }

    /// Link a refund to its original. Returns false if a refund is already linked.
    pub fn link_refund(&self, original: &TransactionId, refund: &TransactionId) -> Result<bool> {
        let swapped = self.refund_links.compare_and_swap(
            original.as_bytes(),
            None as Option<&[u8]>,
            Some(refund.as_bytes().to_vec()),
        )?;
        Ok(swapped.is_ok())
    }

    pub fn refund_of(&self, original: &TransactionId) -> Result<Option<TransactionId>> {
        self.refund_links
            .get(original.as_bytes())?
            .map(|v| uuid_from_ivec(&v))
            .transpose()
    }

    // ---- escrow ----

    pub fn put_pending_refund(&self, refund: &PendingRefund) -> Result<()> {
        self.pending_refunds.insert(refund.id.as_bytes(), encode(refund)?)?;
        Ok(())
    }

    pub fn list_pending_refunds(&self) -> Result<Vec<PendingRefund>> {
        self.pending_refunds
            .iter()
            .values()
            .map(|v| decode(&v?))
            .collect()
    }

    // ---- users ----

    /// Create the user, its address index and its USER account atomically.
    /// Returns the existing user if the address was claimed concurrently.
    pub fn insert_user(&self, user: &User, account: &Account) -> Result<User> {
        let user_row = encode(user)?;
        let account_row = encode(account)?;
        let address = user.public_address.clone();

        (&self.users, &self.user_addresses, &self.accounts)
            .transaction(|(users, addresses, accounts)| -> ConflictableTransactionResult<User, PassportError> {
                if let Some(address) = &address {
                    if let Some(existing_id) = addresses.get(address.as_bytes())? {
                        return match users.get(&existing_id)? {
                            Some(bytes) => decode::<User>(&bytes).or_else(abort),
                            None => abort(PassportError::StorageFault(format!(
                                "address {} points at a missing user",
                                address
                            ))),
                        };
                    }
                    addresses.insert(address.as_bytes(), user.id.as_bytes().to_vec())?;
                }
                users.insert(&user.id.as_bytes()[..], user_row.clone())?;
                accounts.insert(&user.id.as_bytes()[..], account_row.clone())?;
                Ok(user.clone())
            })
            .map_err(tx_err)
    }

    pub fn get_user(&self, id: &AccountId) -> Result<Option<User>> {
        self.users.get(id.as_bytes())?.map(|v| decode(&v)).transpose()
    }

    pub fn get_user_by_address(&self, normalized_address: &str) -> Result<Option<User>> {
        match self.user_addresses.get(normalized_address.as_bytes())? {
            Some(id) => self.get_user(&uuid_from_ivec(&id)?),
            None => Ok(None),
        }
    }

    /// Set the faction only if none is set yet
    pub fn set_user_faction(&self, id: &AccountId, faction: Uuid) -> Result<User> {
        self.users
            .transaction(|users| -> ConflictableTransactionResult<User, PassportError> {
                let mut user: User = match users.get(id.as_bytes())? {
                    Some(bytes) => decode(&bytes).or_else(abort)?,
                    None => return abort(PassportError::NotFound(format!("user {}", id))),
                };
                if user.faction_id.is_some() {
                    return abort(PassportError::Conflict("user already enlisted in a faction".into()));
                }
                user.faction_id = Some(faction);
                let row = encode(&user).or_else(abort)?;
                users.insert(&id.as_bytes()[..], row)?;
                Ok(user)
            })
            .map_err(tx_err)
    }

    // ---- syndicates ----

    pub fn insert_syndicate(&self, syndicate: &Syndicate, account: &Account) -> Result<()> {
        let syndicate_row = encode(syndicate)?;
        let account_row = encode(account)?;
        (&self.syndicates, &self.accounts)
            .transaction(|(syndicates, accounts)| -> ConflictableTransactionResult<(), PassportError> {
                syndicates.insert(&syndicate.id.as_bytes()[..], syndicate_row.clone())?;
                accounts.insert(&syndicate.id.as_bytes()[..], account_row.clone())?;
                Ok(())
            })
            .map_err(tx_err)
    }

    // ---- api keys ----

    pub fn put_api_key(&self, key: &ApiKey) -> Result<()> {
        self.api_keys.insert(key.key_hash.as_bytes(), encode(key)?)?;
        Ok(())
    }

    pub fn get_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        self.api_keys.get(key_hash.as_bytes())?.map(|v| decode(&v)).transpose()
    }

    // ---- collections ----

    pub fn put_collection(&self, collection: &Collection) -> Result<()> {
        self.collections.insert(collection.id.as_bytes(), encode(collection)?)?;
        Ok(())
    }

    pub fn list_collections(&self) -> Result<Vec<Collection>> {
        self.collections.iter().values().map(|v| decode(&v?)).collect()
    }

    // ---- assets ----

    /// Insert a new asset with its hash and token indexes
    pub fn insert_asset(&self, asset: &UserAsset) -> Result<()> {
        let row = encode(asset)?;
        let hash = asset.hash.clone();
        let token = token_key(&asset.collection_id, asset.token_id);

        (&self.user_assets, &self.asset_hashes, &self.asset_tokens)
            .transaction(|(assets, hashes, tokens)| -> ConflictableTransactionResult<(), PassportError> {
                if hashes.get(hash.as_bytes())?.is_some() {
                    return abort(PassportError::Conflict(format!("asset {} already registered", hash)));
                }
                if tokens.get(token.as_slice())?.is_some() {
                    return abort(PassportError::Conflict(format!(
                        "token {} already registered in collection",
                        asset.token_id
                    )));
                }
                assets.insert(&asset.id.as_bytes()[..], row.clone())?;
                hashes.insert(hash.as_bytes(), asset.id.as_bytes().to_vec())?;
                tokens.insert(token.as_slice(), asset.id.as_bytes().to_vec())?;
                Ok(())
            })
            .map_err(tx_err)
    }

    pub fn get_asset(&self, id: &Uuid) -> Result<Option<UserAsset>> {
        self.user_assets.get(id.as_bytes())?.map(|v| decode(&v)).transpose()
    }

    pub fn get_asset_by_hash(&self, hash: &str) -> Result<Option<UserAsset>> {
        match self.asset_hashes.get(hash.as_bytes())? {
            Some(id) => self.get_asset(&uuid_from_ivec(&id)?),
            None => Ok(None),
        }
    }

    pub fn get_asset_by_token(&self, collection_id: &Uuid, token_id: u64) -> Result<Option<UserAsset>> {
        match self.asset_tokens.get(token_key(collection_id, token_id))? {
            Some(id) => self.get_asset(&uuid_from_ivec(&id)?),
            None => Ok(None),
        }
    }

    pub fn list_assets_by_owner(&self, owner: &AccountId) -> Result<Vec<UserAsset>> {
        let mut out = Vec::new();
        for value in self.user_assets.iter().values() {
            let asset: UserAsset = decode(&value?)?;
            if asset.owner_id == *owner && asset.state.is_active() {
                out.push(asset);
            }
        }
        Ok(out)
    }

    /// Read-check-write on a single asset row, atomic against other writers
    pub fn update_asset<F>(&self, hash: &str, mutate: F) -> Result<UserAsset>
    where
        F: Fn(&mut UserAsset) -> Result<()>,
    {
        (&self.user_assets, &self.asset_hashes)
            .transaction(|(assets, hashes)| -> ConflictableTransactionResult<UserAsset, PassportError> {
                let id = match hashes.get(hash.as_bytes())? {
                    Some(id) => id,
                    None => return abort(PassportError::NotFound(format!("asset {}", hash))),
                };
                let mut asset: UserAsset = match assets.get(&id)? {
                    Some(bytes) => decode(&bytes).or_else(abort)?,
                    None => return abort(PassportError::NotFound(format!("asset {}", hash))),
                };
                if !asset.state.is_active() {
                    return abort(PassportError::NotFound(format!("asset {}", hash)));
                }
                mutate(&mut asset).or_else(abort)?;
                asset.updated_at = chrono::Utc::now();
                let row = encode(&asset).or_else(abort)?;
                assets.insert(id.clone(), row)?;
                Ok(asset)
            })
            .map_err(tx_err)
    }

    /// Change the owner and append the transfer event in one transaction.
    ///
    /// `check` sees the current row and may reject the transfer. The event id
    /// is drawn from a counter inside the same transaction, so ids become
    /// visible in commit order and a cursor never skips a late commit.
    pub fn transfer_asset_with_event<F>(
        &self,
        hash: &str,
        event: AssetTransferEvent,
        check: F,
    ) -> Result<(UserAsset, AssetTransferEvent)>
    where
        F: Fn(&UserAsset) -> Result<()>,
    {
        (&self.user_assets, &self.asset_hashes, &self.transfer_events, &self.sequences)
            .transaction(|(assets, hashes, events, sequences)| -> ConflictableTransactionResult<(UserAsset, AssetTransferEvent), PassportError> {
                let id = match hashes.get(hash.as_bytes())? {
                    Some(id) => id,
                    None => return abort(PassportError::NotFound(format!("asset {}", hash))),
                };
                let mut asset: UserAsset = match assets.get(&id)? {
                    Some(bytes) => decode(&bytes).or_else(abort)?,
                    None => return abort(PassportError::NotFound(format!("asset {}", hash))),
                };
                if !asset.state.is_active() {
                    return abort(PassportError::NotFound(format!("asset {}", hash)));
                }
                check(&asset).or_else(abort)?;

                // Event ids start at 1 so a cursor of 0 means "from the beginning"
                let last = match sequences.get(TRANSFER_EVENT_SEQ)? {
                    Some(raw) => match <[u8; 8]>::try_from(raw.as_ref()) {
                        Ok(bytes) => u64::from_be_bytes(bytes),
                        Err(_) => {
                            return abort(PassportError::Serialization("bad transfer event sequence".into()))
                        }
                    },
                    None => 0,
                };
                let mut event = event.clone();
                event.id = last + 1;
                event.asset_id = asset.id;
                event.from_user = asset.owner_id;
                asset.owner_id = event.to_user;
                asset.updated_at = event.transferred_at;

                let asset_row = encode(&asset).or_else(abort)?;
                let event_row = encode(&event).or_else(abort)?;
                assets.insert(id.clone(), asset_row)?;
                sequences.insert(TRANSFER_EVENT_SEQ, &event.id.to_be_bytes()[..])?;
                events.insert(&event.id.to_be_bytes()[..], event_row)?;
                Ok((asset, event))
            })
            .map_err(tx_err)
    }

    /// Transfer events with id strictly greater than `after`
    pub fn transfer_events_since(&self, after: u64, limit: usize) -> Result<Vec<AssetTransferEvent>> {
        let start = after.saturating_add(1).to_be_bytes();
        self.transfer_events
            .range(start..)
            .values()
            .take(limit)
            .map(|v| decode(&v?))
            .collect()
    }

    // ---- deposits ----

    pub fn put_deposit_transaction(&self, deposit: &DepositTransaction) -> Result<()> {
        self.deposit_transactions
            .insert(deposit.tx_hash.to_lowercase().as_bytes(), encode(deposit)?)?;
        Ok(())
    }

    pub fn get_deposit_transaction(&self, tx_hash: &str) -> Result<Option<DepositTransaction>> {
        self.deposit_transactions
            .get(tx_hash.to_lowercase().as_bytes())?
            .map(|v| decode(&v))
            .transpose()
    }

    // ---- kv ----

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.kv
            .get(key.as_bytes())?
            .map(|v| {
                String::from_utf8(v.to_vec())
                    .map_err(|e| PassportError::Serialization(format!("kv '{}': {}", key, e)))
            })
            .transpose()
    }

    pub fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        self.kv.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }
}

impl BalanceStore for LedgerStore {
    fn load_balance(&self, account: &AccountId) -> Result<Option<Decimal>> {
        if let Some(raw) = self.balances.get(account.as_bytes())? {
            let text = std::str::from_utf8(&raw)
                .map_err(|e| PassportError::Serialization(format!("balance of {}: {}", account, e)))?;
            let balance = Decimal::from_str(text)
                .map_err(|e| PassportError::Serialization(format!("balance of {}: {}", account, e)))?;
            return Ok(Some(balance));
        }
        // Known account without a balance row yet
        if self.accounts.contains_key(account.as_bytes())? {
            Ok(Some(Decimal::ZERO))
        } else {
            Ok(None)
        }
    }

    fn store_balance(&self, account: &AccountId, balance: Decimal) -> Result<()> {
        self.balances
            .insert(account.as_bytes(), balance.to_string().as_bytes())?;
        Ok(())
    }
}
