use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::maintenance::Maintenance;
use crate::pubsub::SharedPubSub;
use crate::registry::NodeRegistry;
use crate::session::SessionManager;
use crate::sockets::SocketRegistry;
use crate::storage::SharedStorage;
use crate::transfer::TransferEngine;

/// One relay node, fully wired. Storage and pub/sub handles are injected,
/// so several engines can share one in-memory fabric in a single process
/// to exercise cross-node flows without sockets.
pub struct NodeEngine {
    pub config: Arc<Config>,
    pub storage: SharedStorage,
    pub pubsub: SharedPubSub,
    pub sockets: Arc<SocketRegistry>,
    pub registry: Arc<NodeRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub sessions: Arc<SessionManager>,
    pub transfers: Arc<TransferEngine>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeEngine {
    pub async fn bootstrap(
        config: Config,
        storage: SharedStorage,
        pubsub: SharedPubSub,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let sockets = Arc::new(SocketRegistry::new());
        let registry = NodeRegistry::bootstrap(config.clone(), storage.clone()).await?;
        let coordinator = Coordinator::new(
            config.clone(),
            storage.clone(),
            pubsub.clone(),
            sockets.clone(),
            registry.clone(),
        );
        let sessions = SessionManager::new(
            config.clone(),
            storage.clone(),
            pubsub.clone(),
            coordinator.clone(),
        );
        let transfers = TransferEngine::new(config.clone(), storage.clone(), coordinator.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            storage,
            pubsub,
            sockets,
            registry,
            coordinator,
            sessions,
            transfers,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        self.registry.node_id()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawns the background loops: bus subscriptions, leader election,
    /// node heartbeat, ack scanning, and storage sweeps.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown_signal();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = coordinator.run_subscriptions(shutdown).await {
                error!(%err, "cluster bus subscription failed");
            }
        }));

        let coordinator = self.coordinator.clone();
        tasks.push(tokio::spawn(coordinator.run_election(self.shutdown_signal())));

        let registry = self.registry.clone();
        tasks.push(tokio::spawn(registry.run(self.shutdown_signal())));

        let transfers = self.transfers.clone();
        tasks.push(tokio::spawn(transfers.run_ack_scan(self.shutdown_signal())));

        let maintenance = Maintenance::new(
            self.config.clone(),
            self.storage.clone(),
            self.transfers.clone(),
        );
        tasks.push(tokio::spawn(maintenance.run(self.shutdown_signal())));

        info!(node_id = %self.node_id(), "node engine started");
    }

    /// Graceful stop: cancel timers, retire the node record, and leave the
    /// master lock to expire on its own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.shutdown_drain, task)
                .await
                .is_err()
            {
                error!("background task did not stop within the drain window, aborting");
                abort.abort();
            }
        }
        self.registry.shutdown().await;
        info!(node_id = %self.node_id(), "node engine stopped");
    }
}
