use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use beamdrop_protocol::{Channel, NodeRole, RouteMessage, RoutingRequest, ServerEvent};
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::model::now_ms;
use crate::pubsub::{decode_payload, encode_payload, PubSub, SharedPubSub};
use crate::registry::NodeRegistry;
use crate::sockets::SocketRegistry;
use crate::storage::{latest_session, SharedStorage, Storage};

const PENDING_ROUTE_CAP: usize = 256;

struct PendingRequest {
    request: RoutingRequest,
    queued_at_ms: u64,
}

/// Cluster brain: renews the leader lock and routes server events to a
/// target client wherever its socket lives. Holds the session store, the
/// bus, and this node's socket map; nothing holds the coordinator back.
pub struct Coordinator {
    config: Arc<Config>,
    storage: SharedStorage,
    pubsub: SharedPubSub,
    sockets: Arc<SocketRegistry>,
    registry: Arc<NodeRegistry>,
    is_master: AtomicBool,
    // routing:request traffic observed while the cluster had no master;
    // drained on promotion so requests issued during a gap still land.
    pending_requests: Mutex<Vec<PendingRequest>>,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        storage: SharedStorage,
        pubsub: SharedPubSub,
        sockets: Arc<SocketRegistry>,
        registry: Arc<NodeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            pubsub,
            sockets,
            registry,
            is_master: AtomicBool::new(false),
            pending_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        self.registry.node_id()
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub async fn current_master(&self) -> Option<String> {
        match self.storage.current_master().await {
            Ok(master) => master,
            Err(err) => {
                error!(%err, "master lookup failed");
                None
            }
        }
    }

    // ── Leader election ─────────────────────────────────────────

    /// One election round: take the lock, or refresh it if already ours,
    /// or settle into the worker role.
    pub async fn elect_once(&self) {
        let node_id = self.node_id().to_string();
        match self
            .storage
            .try_acquire_master_lock(&node_id, self.config.master_lock_ttl)
            .await
        {
            Ok(true) => self.become_master().await,
            Ok(false) => {
                match self
                    .storage
                    .refresh_master_lock(&node_id, self.config.master_lock_ttl)
                    .await
                {
                    Ok(true) => self.become_master().await,
                    Ok(false) => self.become_worker().await,
                    Err(err) => error!(%err, "master lock refresh failed"),
                }
            }
            Err(err) => {
                // Store unreachable: keep the current role; the surviving
                // side of a partition takes over on a later round.
                error!(%err, "election round failed");
            }
        }
    }

    async fn become_master(&self) {
        if self.is_master.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node_id(), "assumed master role");
        if let Err(err) = self.registry.set_role(NodeRole::Master).await {
            error!(%err, "failed to persist master role");
        }
        self.sockets
            .broadcast(ServerEvent::ClusterRoleChange {
                node_id: self.node_id().to_string(),
                role: NodeRole::Master,
                is_master: true,
            })
            .await;
        self.drain_pending_requests().await;
    }

    async fn become_worker(&self) {
        if !self.is_master.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node_id(), "stepped down to worker role");
        if let Err(err) = self.registry.set_role(NodeRole::Worker).await {
            error!(%err, "failed to persist worker role");
        }
        self.sockets
            .broadcast(ServerEvent::ClusterRoleChange {
                node_id: self.node_id().to_string(),
                role: NodeRole::Worker,
                is_master: false,
            })
            .await;
    }

    pub async fn run_election(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.election_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.elect_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── Routing ─────────────────────────────────────────────────

    /// Deliver `event` to `target_client_id` wherever it is connected:
    /// local socket first, then the owning node via `message:route`, then
    /// the master fallback ladder.
    pub async fn route_to_client(&self, target_client_id: &str, event: ServerEvent) -> bool {
        // Local fast path.
        if self.sockets.send_to_client(target_client_id, event.clone()).await {
            return true;
        }

        // Direct worker-to-worker via the session store.
        match latest_session(self.storage.as_ref(), target_client_id).await {
            Ok(Some(session)) if session.connected => {
                if session.node_id == self.node_id() {
                    // Cache miss on the fast path; retry by socket id.
                    if self
                        .sockets
                        .send_to_socket(&session.socket_id, event.clone())
                        .await
                    {
                        return true;
                    }
                } else {
                    let msg = RouteMessage {
                        target_node_id: session.node_id.clone(),
                        target_client_id: target_client_id.to_string(),
                        socket_id: Some(session.socket_id.clone()),
                        event: event.clone(),
                    };
                    if self.publish_route(&msg).await {
                        return true;
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, target_client_id, "session lookup failed while routing"),
        }

        if !self.is_master() {
            // Worker fallback: hand the problem to the master.
            let request = RoutingRequest {
                target_client_id: target_client_id.to_string(),
                event,
            };
            match encode_payload(Channel::RoutingRequest, &request) {
                Ok(payload) => {
                    if let Err(err) = self.pubsub.publish(Channel::RoutingRequest, payload).await {
                        error!(%err, "failed to publish routing request");
                        return false;
                    }
                    return true;
                }
                Err(err) => {
                    error!(%err, "failed to encode routing request");
                    return false;
                }
            }
        }

        self.master_fanout(target_client_id, event).await
    }

    /// Master fallback: walk every known session of the target and deliver
    /// locally or forward to the owning node.
    async fn master_fanout(&self, target_client_id: &str, event: ServerEvent) -> bool {
        let sessions = match self.storage.sessions_for_client(target_client_id).await {
            Ok(sessions) => sessions,
            Err(err) => {
                error!(%err, target_client_id, "master fan-out session lookup failed");
                return false;
            }
        };
        let mut delivered = false;
        for session in sessions.iter().filter(|s| s.connected) {
            if session.node_id == self.node_id() {
                if self
                    .sockets
                    .send_to_socket(&session.socket_id, event.clone())
                    .await
                    || self
                        .sockets
                        .send_to_client(target_client_id, event.clone())
                        .await
                {
                    delivered = true;
                }
            } else {
                let msg = RouteMessage {
                    target_node_id: session.node_id.clone(),
                    target_client_id: target_client_id.to_string(),
                    socket_id: Some(session.socket_id.clone()),
                    event: event.clone(),
                };
                delivered |= self.publish_route(&msg).await;
            }
        }
        if !delivered {
            debug!(target_client_id, "no deliverable session found during fan-out");
        }
        delivered
    }

    async fn publish_route(&self, msg: &RouteMessage) -> bool {
        match encode_payload(Channel::MessageRoute, msg) {
            Ok(payload) => match self.pubsub.publish(Channel::MessageRoute, payload).await {
                Ok(()) => true,
                Err(err) => {
                    error!(%err, "failed to publish message:route");
                    false
                }
            },
            Err(err) => {
                error!(%err, "failed to encode message:route");
                false
            }
        }
    }

    // ── Subscriptions ───────────────────────────────────────────

    /// Consume the cluster bus until shutdown. One sequential loop keeps
    /// per-channel ordering intact.
    pub async fn run_subscriptions(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut route_sub = self.pubsub.subscribe(Channel::MessageRoute).await?;
        let mut request_sub = self.pubsub.subscribe(Channel::RoutingRequest).await?;
        let mut session_created = self.pubsub.subscribe(Channel::SessionCreated).await?;
        let mut session_ended = self.pubsub.subscribe(Channel::SessionEnded).await?;
        let mut share_created = self.pubsub.subscribe(Channel::ShareCreated).await?;

        loop {
            tokio::select! {
                Some(payload) = route_sub.recv() => self.on_route_message(&payload).await,
                Some(payload) = request_sub.recv() => self.on_routing_request(&payload).await,
                Some(payload) = session_created.recv() => {
                    debug!(payload = %payload, "session created elsewhere");
                }
                Some(payload) = session_ended.recv() => {
                    debug!(payload = %payload, "session ended elsewhere");
                }
                Some(payload) = share_created.recv() => {
                    debug!(payload = %payload, "share created elsewhere");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
        Ok(())
    }

    async fn on_route_message(&self, payload: &str) {
        let msg: RouteMessage = match decode_payload(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "undecodable message:route payload");
                return;
            }
        };
        if msg.target_node_id != self.node_id() {
            return;
        }
        // Resolve by socket id first; sockets reconnect under new ids, so
        // fall back to the client id against the local map.
        if let Some(socket_id) = &msg.socket_id {
            if self.sockets.send_to_socket(socket_id, msg.event.clone()).await {
                return;
            }
        }
        if self
            .sockets
            .send_to_client(&msg.target_client_id, msg.event.clone())
            .await
        {
            return;
        }
        warn!(
            target_client_id = %msg.target_client_id,
            event = msg.event.name(),
            "dropping routed message: no local socket"
        );
    }

    async fn on_routing_request(&self, payload: &str) {
        let request: RoutingRequest = match decode_payload(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "undecodable routing:request payload");
                return;
            }
        };
        if self.is_master() {
            self.master_fanout(&request.target_client_id, request.event)
                .await;
            return;
        }
        // Not the master. If nobody is, the sender published into a leader
        // gap; park the request and replay it if this node is promoted.
        if self.current_master().await.is_none() {
            let mut pending = self.pending_requests.lock().await;
            if pending.len() >= PENDING_ROUTE_CAP {
                pending.remove(0);
            }
            pending.push(PendingRequest {
                request,
                queued_at_ms: now_ms(),
            });
        } else {
            self.pending_requests.lock().await.clear();
        }
    }

    async fn drain_pending_requests(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending_requests.lock().await;
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "replaying routing requests parked during leader gap");
        let max_age_ms = self.config.master_lock_ttl.as_millis() as u64;
        let now = now_ms();
        for pending in drained {
            if now.saturating_sub(pending.queued_at_ms) > max_age_ms {
                continue;
            }
            self.master_fanout(&pending.request.target_client_id, pending.request.event)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClientSession;
    use crate::pubsub::memory::MemoryPubSub;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;
    use std::time::Duration;

    async fn build_coordinator(
        storage: SharedStorage,
        pubsub: SharedPubSub,
        hostname: &str,
        port: u16,
    ) -> (Arc<Coordinator>, Arc<SocketRegistry>) {
        let config = Arc::new(Config {
            hostname: hostname.into(),
            port,
            master_lock_ttl: Duration::from_millis(120),
            ..Config::default()
        });
        let registry = NodeRegistry::bootstrap(config.clone(), storage.clone())
            .await
            .unwrap();
        let sockets = Arc::new(SocketRegistry::new());
        let coordinator = Coordinator::new(config, storage, pubsub, sockets.clone(), registry);
        (coordinator, sockets)
    }

    #[tokio::test]
    async fn only_one_node_wins_an_election_epoch() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let pubsub: SharedPubSub = Arc::new(MemoryPubSub::new());
        let (n1, _) = build_coordinator(storage.clone(), pubsub.clone(), "h1", 1).await;
        let (n2, _) = build_coordinator(storage.clone(), pubsub.clone(), "h2", 2).await;

        n1.elect_once().await;
        n2.elect_once().await;
        assert!(n1.is_master());
        assert!(!n2.is_master());
        assert_eq!(n1.current_master().await.as_deref(), Some(n1.node_id()));
    }

    #[tokio::test]
    async fn surviving_node_takes_over_after_lock_expiry() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let pubsub: SharedPubSub = Arc::new(MemoryPubSub::new());
        let (n1, _) = build_coordinator(storage.clone(), pubsub.clone(), "h1", 1).await;
        let (n2, _) = build_coordinator(storage.clone(), pubsub.clone(), "h2", 2).await;

        n1.elect_once().await;
        assert!(n1.is_master());

        // n1 stops refreshing; after the lease lapses n2 wins.
        tokio::time::sleep(Duration::from_millis(150)).await;
        n2.elect_once().await;
        assert!(n2.is_master());
    }

    #[tokio::test]
    async fn master_keeps_lock_by_refreshing() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let pubsub: SharedPubSub = Arc::new(MemoryPubSub::new());
        let (n1, _) = build_coordinator(storage.clone(), pubsub.clone(), "h1", 1).await;
        let (n2, _) = build_coordinator(storage.clone(), pubsub.clone(), "h2", 2).await;

        n1.elect_once().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        n1.elect_once().await; // refresh within the lease
        tokio::time::sleep(Duration::from_millis(80)).await;
        n2.elect_once().await; // lease still live thanks to the refresh
        assert!(n1.is_master());
        assert!(!n2.is_master());
    }

    #[tokio::test]
    async fn routes_locally_via_fast_path() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let pubsub: SharedPubSub = Arc::new(MemoryPubSub::new());
        let (coordinator, sockets) = build_coordinator(storage, pubsub, "h1", 1).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sockets.bind_socket("s1", tx).await;
        sockets.bind_client("alice", "s1").await;

        assert!(
            coordinator
                .route_to_client("alice", ServerEvent::HeartbeatAck { timestamp_ms: 1 })
                .await
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerEvent::HeartbeatAck { .. }
        ));
    }

    #[tokio::test]
    async fn routes_cross_node_over_message_route() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let pubsub: SharedPubSub = Arc::new(MemoryPubSub::new());
        let (n1, _) = build_coordinator(storage.clone(), pubsub.clone(), "h1", 1).await;
        let (n2, _) = build_coordinator(storage.clone(), pubsub.clone(), "h2", 2).await;

        let session = ClientSession::new("bob".into(), "s-remote".into(), n2.node_id().to_string());
        storage.put_session(&session, Duration::from_secs(60)).await.unwrap();

        let mut route_sub = pubsub.subscribe(Channel::MessageRoute).await.unwrap();
        assert!(
            n1.route_to_client("bob", ServerEvent::HeartbeatAck { timestamp_ms: 2 })
                .await
        );
        let payload = route_sub.recv().await.unwrap();
        let msg: RouteMessage = decode_payload(&payload).unwrap();
        assert_eq!(msg.target_node_id, n2.node_id());
        assert_eq!(msg.target_client_id, "bob");
        assert_eq!(msg.socket_id.as_deref(), Some("s-remote"));
    }
}
