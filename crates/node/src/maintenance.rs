use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

use crate::config::Config;
use crate::storage::{SharedStorage, Storage};
use crate::transfer::TransferEngine;

/// Periodic housekeeping: purges expired entries from the embedded store
/// and reaps uploads nobody is touching anymore.
pub struct Maintenance {
    config: Arc<Config>,
    storage: SharedStorage,
    transfers: Arc<TransferEngine>,
}

impl Maintenance {
    pub fn new(
        config: Arc<Config>,
        storage: SharedStorage,
        transfers: Arc<TransferEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            transfers,
        })
    }

    pub async fn sweep_once(&self) {
        if let Err(err) = self.storage.sweep_expired().await {
            error!(%err, "storage sweep failed");
        }
        self.transfers.reap_stale_uploads().await;
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
