use std::sync::Arc;

use anyhow::Result;
use beamdrop_protocol::NodeRole;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::model::{now_ms, NodeRecord, NodeStatus};
use crate::storage::{SharedStorage, Storage};

/// This node's membership in the cluster: registration on boot, periodic
/// heartbeats, stale-peer demotion, and graceful retirement.
pub struct NodeRegistry {
    node_id: String,
    config: Arc<Config>,
    storage: SharedStorage,
}

impl NodeRegistry {
    /// Looks up an existing record for this `(hostname, port)` and revives
    /// it, or registers a fresh node id.
    pub async fn bootstrap(config: Arc<Config>, storage: SharedStorage) -> Result<Arc<Self>> {
        let node = match storage
            .find_node_by_endpoint(&config.hostname, config.port)
            .await?
        {
            Some(mut existing) => {
                existing.status = NodeStatus::Active;
                existing.role = NodeRole::Worker;
                existing.last_heartbeat_ms = now_ms();
                info!(node_id = %existing.id, "reusing node registration");
                existing
            }
            None => {
                let fresh = NodeRecord::new(config.hostname.clone(), config.port);
                info!(node_id = %fresh.id, hostname = %fresh.hostname, port = fresh.port, "registered new node");
                fresh
            }
        };
        storage.put_node(&node).await?;
        Ok(Arc::new(Self {
            node_id: node.id,
            config,
            storage,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn set_role(&self, role: NodeRole) -> Result<()> {
        if let Some(mut node) = self.storage.get_node(&self.node_id).await? {
            node.role = role;
            self.storage.put_node(&node).await?;
        }
        Ok(())
    }

    pub async fn heartbeat_once(&self) {
        match self.storage.get_node(&self.node_id).await {
            Ok(Some(mut node)) => {
                node.last_heartbeat_ms = now_ms();
                node.status = NodeStatus::Active;
                if let Err(err) = self.storage.put_node(&node).await {
                    error!(%err, "node heartbeat write failed");
                }
            }
            Ok(None) => {
                // Record vanished (store flush); re-register under the same id.
                let mut node = NodeRecord::new(self.config.hostname.clone(), self.config.port);
                node.id = self.node_id.clone();
                if let Err(err) = self.storage.put_node(&node).await {
                    error!(%err, "node re-registration failed");
                }
            }
            Err(err) => error!(%err, "node heartbeat read failed"),
        }
    }

    /// Flip peers silent for longer than the stale window to `dead` and
    /// mark their sessions disconnected.
    pub async fn sweep_dead(&self) {
        let nodes = match self.storage.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!(%err, "node sweep list failed");
                return;
            }
        };
        let now = now_ms();
        let stale_after_ms = self.config.node_stale_after.as_millis() as u64;
        for mut node in nodes {
            if node.id == self.node_id || !node.is_stale(now, stale_after_ms) {
                continue;
            }
            warn!(node_id = %node.id, "marking silent node dead");
            node.status = NodeStatus::Dead;
            if let Err(err) = self.storage.put_node(&node).await {
                error!(%err, node_id = %node.id, "failed to mark node dead");
                continue;
            }
            self.disconnect_sessions_on(&node.id).await;
        }
    }

    async fn disconnect_sessions_on(&self, node_id: &str) {
        let sessions = match self.storage.sessions_on_node(node_id).await {
            Ok(sessions) => sessions,
            Err(err) => {
                error!(%err, node_id, "failed to list sessions of dead node");
                return;
            }
        };
        for mut session in sessions {
            if !session.connected {
                continue;
            }
            session.connected = false;
            if let Err(err) = self
                .storage
                .put_session(&session, self.config.ttl_client_session)
                .await
            {
                error!(%err, client_id = %session.client_id, "failed to deactivate session");
            }
        }
    }

    pub async fn active_nodes(&self) -> Result<Vec<NodeRecord>> {
        let nodes = self.storage.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect())
    }

    /// Heartbeat + dead sweep loop; exits on shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.node_heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat_once().await;
                    self.sweep_dead().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Graceful retirement: local sessions deactivated, node marked
    /// `inactive`. The master lock, if held, is left to expire.
    pub async fn shutdown(&self) {
        self.disconnect_sessions_on(&self.node_id).await;
        match self.storage.get_node(&self.node_id).await {
            Ok(Some(mut node)) => {
                node.status = NodeStatus::Inactive;
                node.role = NodeRole::Worker;
                if let Err(err) = self.storage.put_node(&node).await {
                    error!(%err, "failed to mark node inactive");
                }
            }
            Ok(None) => {}
            Err(err) => error!(%err, "failed to load own node during shutdown"),
        }
        info!(node_id = %self.node_id, "node retired");
    }
}
