//! Users, syndicates, factions and service API keys

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PassportError, Result};
use crate::kv::{KvStore, SYNDICATE_CREATE_FEE, SYNDICATE_CREATE_FEE_CUT};
use crate::store::LedgerStore;
use crate::transactor::Transactor;
use crate::types::{
    now_nanos, normalize_address, sha256_hex, Account, AccountId, AccountType, ApiKey, ApiKeyType,
    LifecycleState, Syndicate, SystemAccount, TransferRequest, User,
};

/// Syndicate registration fee when the kv store has none: 5000 SUPS
const DEFAULT_SYNDICATE_FEE: &str = "5000000000000000000000";
const DEFAULT_SYNDICATE_FEE_CUT: &str = "0.5";

pub struct AccountDirectory {
    store: LedgerStore,
    transactor: Arc<Transactor>,
    kv: KvStore,
}

impl AccountDirectory {
    pub fn new(store: LedgerStore, transactor: Arc<Transactor>, kv: KvStore) -> Self {
        Self { store, transactor, kv }
    }

    /// Create the well-known system accounts if missing
    pub fn seed_system_accounts(&self) -> Result<()> {
        let mut created = 0;
        for system in SystemAccount::ALL {
            if self.store.create_account(&Account::new(system.id(), AccountType::System))? {
                created += 1;
            }
        }
        if created > 0 {
            info!(created, "Seeded system accounts");
        }
        Ok(())
    }

    pub fn get_user(&self, id: &AccountId) -> Result<User> {
        self.store
            .get_user(id)?
            .filter(|u| u.state.is_active())
            .ok_or_else(|| PassportError::NotFound(format!("user {}", id)))
    }

    /// Look up a user by wallet address, creating user and account if unseen.
    ///
    /// Address matching is case-insensitive. New users are named after the
    /// first 10 characters of their address.
    pub fn create_or_get_user_by_address(&self, address: &str) -> Result<User> {
        let normalized = normalize_address(address);
        if normalized.is_empty() {
            return Err(PassportError::InvalidInput("address must not be empty".into()));
        }
        if let Some(user) = self.store.get_user_by_address(&normalized)? {
            if !user.state.is_active() {
                return Err(PassportError::NotFound(format!("user for address {}", normalized)));
            }
            return Ok(user);
        }

        let user = User {
            id: Uuid::new_v4(),
            username: address.trim().chars().take(10).collect(),
            public_address: Some(normalized.clone()),
            faction_id: None,
            state: LifecycleState::Active,
            created_at: Utc::now(),
        };
        let stored = self
            .store
            .insert_user(&user, &Account::new(user.id, AccountType::User))?;
        if stored.id == user.id {
            info!(user_id = %user.id, address = %normalized, "Created user for address");
        }
        Ok(stored)
    }

    /// Create a user without a wallet address
    pub fn create_user(&self, username: &str) -> Result<User> {
        if username.trim().is_empty() {
            return Err(PassportError::InvalidInput("username must not be empty".into()));
        }
        let user = User {
            id: Uuid::new_v4(),
            username: username.trim().to_string(),
            public_address: None,
            faction_id: None,
            state: LifecycleState::Active,
            created_at: Utc::now(),
        };
        self.store
            .insert_user(&user, &Account::new(user.id, AccountType::User))
    }

    /// Enlist a user in one of the seeded factions
    pub fn enlist_faction(&self, user_id: &AccountId, faction_id: &Uuid) -> Result<User> {
        let faction = SystemAccount::from_id(faction_id)
            .filter(|s| SystemAccount::FACTIONS.contains(s))
            .ok_or_else(|| PassportError::NotFound(format!("faction {}", faction_id)))?;
        self.get_user(user_id)?;
        let user = self.store.set_user_faction(user_id, *faction_id)?;
        info!(user_id = %user_id, faction = faction.name(), "User enlisted");
        Ok(user)
    }

    /// Register a syndicate founded by `founder`.
    ///
    /// The founder pays the registration fee to the game account, which then
    /// funds the new syndicate account with the fee minus its cut.
    pub fn register_syndicate(
        &self,
        syndicate_id: Uuid,
        founder: &AccountId,
        name: &str,
        service_id: &str,
    ) -> Result<Syndicate> {
        let founder_user = self.get_user(founder)?;
        let faction_id = founder_user
            .faction_id
            .ok_or_else(|| PassportError::InvalidInput("user does not have a faction".into()))?;
        if name.trim().is_empty() {
            return Err(PassportError::InvalidInput("syndicate name must not be empty".into()));
        }
        if self.store.get_account(&syndicate_id)?.is_some() {
            return Err(PassportError::Conflict(format!("syndicate {} already exists", syndicate_id)));
        }

        let fee = self.kv.get_decimal(
            SYNDICATE_CREATE_FEE,
            Decimal::from_str(DEFAULT_SYNDICATE_FEE).unwrap_or_default(),
        )?;
        let cut = self.kv.get_decimal(
            SYNDICATE_CREATE_FEE_CUT,
            Decimal::from_str(DEFAULT_SYNDICATE_FEE_CUT).unwrap_or_default(),
        )?;
        let start_fund = fee - fee * cut;
        let game = SystemAccount::SupremacyGame.id();

        let fee_tx = self.transactor.transact(
            TransferRequest::new(
                *founder,
                game,
                fee,
                format!("syndicate_create|SUPREMACY|{}|{}", syndicate_id, now_nanos()),
            )
            .description("Start a new syndicate")
            .group("SUPREMACY", "syndicate create")
            .service(service_id),
        )?;

        let syndicate = Syndicate {
            id: syndicate_id,
            name: name.trim().to_string(),
            founded_by: *founder,
            faction_id: Some(faction_id),
            state: LifecycleState::Active,
            created_at: Utc::now(),
        };
        if let Err(e) = self
            .store
            .insert_syndicate(&syndicate, &Account::new(syndicate_id, AccountType::Syndicate))
        {
            warn!(syndicate_id = %syndicate_id, error = %e, "Syndicate insert failed, refunding fee");
            self.transactor.refund(&fee_tx, Some(service_id))?;
            return Err(e);
        }

        if start_fund > Decimal::ZERO {
            self.transactor.transact(
                TransferRequest::new(
                    game,
                    syndicate_id,
                    start_fund,
                    format!("syndicate_start_fund|SUPREMACY|{}|{}", syndicate_id, now_nanos()),
                )
                .description("Fund for starting syndicate")
                .group("SUPREMACY", "syndicate create")
                .service(service_id),
            )?;
        }

        info!(syndicate_id = %syndicate_id, founder = %founder, %fee, %start_fund, "Syndicate registered");
        Ok(syndicate)
    }

    /// Issue a new API key. Only its digest is stored.
    pub fn issue_api_key(&self, service_id: &str, key_type: ApiKeyType) -> Result<String> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let key = hex::encode(raw);
        self.store.put_api_key(&ApiKey {
            key_hash: sha256_hex(&key),
            key_type,
            service_id: service_id.to_string(),
            state: LifecycleState::Active,
        })?;
        info!(service_id, ?key_type, "API key issued");
        Ok(key)
    }

    /// Service id behind a `SERVER_CLIENT` key
    pub fn authenticate_server_client(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(PassportError::Forbidden("missing api key".into()));
        }
        let entry = self
            .store
            .get_api_key(&sha256_hex(key))?
            .filter(|k| k.state.is_active())
            .ok_or_else(|| PassportError::Forbidden("invalid api key".into()))?;
        if entry.key_type != ApiKeyType::ServerClient {
            warn!(service_id = %entry.service_id, key_type = ?entry.key_type, "API key lacks SERVER_CLIENT permission");
            return Err(PassportError::Forbidden("api key is missing SERVER_CLIENT permission".into()));
        }
        Ok(entry.service_id)
    }
}
