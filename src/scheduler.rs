//! Periodic background sync tasks
//!
//! Each job runs on its own tokio interval so a slow NFT sync never delays
//! deposits. A run is bounded by the batch timeout; a run that times out is
//! dropped and the job waits for its next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::kv::{self, KvStore};
use crate::nft_sync::NftSync;
use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncJob {
    Ping,
    Deposits,
    Withdrawals,
    Purchases,
    NftOwners,
}

impl SyncJob {
    pub const ALL: [SyncJob; 5] = [
        SyncJob::Ping,
        SyncJob::Deposits,
        SyncJob::Withdrawals,
        SyncJob::Purchases,
        SyncJob::NftOwners,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SyncJob::Ping => "avant_ping",
            SyncJob::Deposits => "sync_deposits",
            SyncJob::Withdrawals => "sync_withdraw",
            SyncJob::Purchases => "sync_payments",
            SyncJob::NftOwners => "sync_nft_owners",
        }
    }

    /// kv flag gating the job, off unless set
    fn enable_key(&self) -> Option<&'static str> {
        match self {
            SyncJob::Ping => None,
            SyncJob::Deposits => Some(kv::ENABLE_SYNC_DEPOSITS),
            SyncJob::Withdrawals => Some(kv::ENABLE_SYNC_WITHDRAW),
            SyncJob::Purchases => Some(kv::ENABLE_SYNC_PAYMENTS),
            SyncJob::NftOwners => Some(kv::ENABLE_SYNC_NFT_OWNERS),
        }
    }
}

pub struct SyncScheduler {
    reconciler: Arc<Reconciler>,
    nft_sync: Arc<NftSync>,
    kv: KvStore,
    tick: Duration,
    batch_timeout: Duration,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<Reconciler>, nft_sync: Arc<NftSync>, kv: KvStore, sync: &SyncConfig) -> Self {
        Self::with_intervals(
            reconciler,
            nft_sync,
            kv,
            Duration::from_secs(sync.tick_interval_secs.max(1)),
            Duration::from_secs(sync.batch_timeout_secs.max(1)),
        )
    }

    pub fn with_intervals(
        reconciler: Arc<Reconciler>,
        nft_sync: Arc<NftSync>,
        kv: KvStore,
        tick: Duration,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            reconciler,
            nft_sync,
            kv,
            tick,
            batch_timeout,
        }
    }

    /// Spawn one task per job. Tasks exit once `shutdown` flips to true or
    /// its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(tick = ?self.tick, batch_timeout = ?self.batch_timeout, "Starting sync scheduler");
        SyncJob::ALL
            .iter()
            .map(|job| self.clone().spawn_job(*job, shutdown.clone()))
            .collect()
    }

    fn spawn_job(self: Arc<Self>, job: SyncJob, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                self.tick_once(job).await;
            }
            debug!(job = job.name(), "Sync task stopped");
        })
    }

    /// Run `job` once if its flag is on, bounded by the batch timeout
    pub async fn tick_once(&self, job: SyncJob) {
        if let Some(key) = job.enable_key() {
            match self.kv.get_bool(key, false) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    error!(job = job.name(), error = %e, "Failed to read sync flag");
                    return;
                }
            }
        }

        match timeout(self.batch_timeout, self.run_once(job)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(job = job.name(), error = %e, "Sync run failed"),
            Err(_) => warn!(job = job.name(), timeout = ?self.batch_timeout, "Sync run timed out"),
        }
    }

    async fn run_once(&self, job: SyncJob) -> Result<()> {
        match job {
            SyncJob::Ping => self.reconciler.ping().await,
            SyncJob::Deposits => self.reconciler.sync_deposits().await.map(|_| ()),
            SyncJob::Withdrawals => self.reconciler.sync_withdrawals().await.map(|_| ()),
            SyncJob::Purchases => self.reconciler.sync_purchases().await.map(|_| ()),
            SyncJob::NftOwners => self.nft_sync.sync_all().await.map(|_| ()),
        }
    }
}
