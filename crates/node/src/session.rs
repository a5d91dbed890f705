use std::sync::Arc;

use beamdrop_protocol::{Channel, ServerEvent, SessionAnnounce, ShareAnnounce};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{RelayError, RelayResult};
use crate::model::{now_ms, ClientSession, ShareSession, ShareStatus};
use crate::pubsub::{encode_payload, PubSub, SharedPubSub};
use crate::storage::{latest_session, SharedStorage, Storage, USERS_JOINED_COUNTER};

/// Client sessions and two-party share rooms: registration, admission,
/// join/create/leave, and the events both participants see.
pub struct SessionManager {
    config: Arc<Config>,
    storage: SharedStorage,
    pubsub: SharedPubSub,
    coordinator: Arc<Coordinator>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        storage: SharedStorage,
        pubsub: SharedPubSub,
        coordinator: Arc<Coordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            pubsub,
            coordinator,
        })
    }

    fn node_id(&self) -> &str {
        self.coordinator.node_id()
    }

    async fn publish(&self, channel: Channel, payload: impl serde::Serialize) {
        match encode_payload(channel, &payload) {
            Ok(json) => {
                if let Err(err) = self.pubsub.publish(channel, json).await {
                    error!(%err, channel = channel.as_str(), "publish failed");
                }
            }
            Err(err) => error!(%err, channel = channel.as_str(), "payload encode failed"),
        }
    }

    // ── Registration & heartbeat ────────────────────────────────

    pub async fn register(&self, client_id: &str, socket_id: &str) -> RelayResult<ServerEvent> {
        if client_id.is_empty() {
            return Err(RelayError::BadRequest("clientId is required".into()));
        }
        let first_seen = self
            .storage
            .sessions_for_client(client_id)
            .await
            .map(|sessions| sessions.is_empty())
            .unwrap_or(false);

        let session = ClientSession::new(
            client_id.to_string(),
            socket_id.to_string(),
            self.node_id().to_string(),
        );
        self.storage
            .put_session(&session, self.config.ttl_client_session)
            .await
            .map_err(|err| {
                error!(%err, client_id, "failed to persist session");
                RelayError::ServiceUnavailable("session store unavailable".into())
            })?;

        if first_seen {
            if let Err(err) = self.storage.incr_counter(USERS_JOINED_COUNTER).await {
                warn!(%err, "usersJoined counter increment failed");
            }
        }

        self.publish(
            Channel::SessionCreated,
            SessionAnnounce {
                client_id: client_id.to_string(),
                node_id: self.node_id().to_string(),
                socket_id: socket_id.to_string(),
            },
        )
        .await;

        info!(client_id, socket_id, "client registered");
        Ok(ServerEvent::Registered {
            node_id: self.node_id().to_string(),
            is_master: self.coordinator.is_master(),
            master_id: self.coordinator.current_master().await,
        })
    }

    pub async fn heartbeat(&self, client_id: &str, socket_id: &str) -> RelayResult<ServerEvent> {
        let decision = self
            .storage
            .check_rate_limit(
                &format!("heartbeat:{client_id}"),
                self.config.heartbeat_rate_limit,
                self.config.rate_limit_window,
            )
            .await;
        match decision {
            Ok(decision) if !decision.allowed => {
                return Err(RelayError::RateLimited {
                    reset_at_ms: decision.reset_at_ms,
                });
            }
            Ok(_) => {}
            // A broken limiter must not take heartbeats down with it.
            Err(err) => warn!(%err, "rate limit check failed, allowing"),
        }

        if let Ok(Some(mut session)) = self.storage.get_session(client_id, socket_id).await {
            session.last_heartbeat_ms = now_ms();
            session.connected = true;
            if let Err(err) = self
                .storage
                .put_session(&session, self.config.ttl_client_session)
                .await
            {
                warn!(%err, client_id, "heartbeat session refresh failed");
            }
        }
        Ok(ServerEvent::HeartbeatAck {
            timestamp_ms: now_ms(),
        })
    }

    // ── Shares ──────────────────────────────────────────────────

    pub async fn create_share(
        &self,
        client_id: &str,
        share_id: Option<String>,
    ) -> RelayResult<ShareSession> {
        if client_id.is_empty() {
            return Err(RelayError::BadRequest("clientId is required".into()));
        }
        let session = latest_session(self.storage.as_ref(), client_id)
            .await
            .map_err(|err| {
                error!(%err, "session lookup failed");
                RelayError::ServiceUnavailable("session store unavailable".into())
            })?
            .ok_or_else(|| RelayError::BadRequest("client is not registered".into()))?;
        if let Some(existing) = &session.share_id {
            return Err(RelayError::Conflict(format!(
                "client already belongs to share {existing}"
            )));
        }

        let share_id = match share_id {
            Some(requested) => {
                if requested.is_empty() {
                    return Err(RelayError::BadRequest("shareId must not be empty".into()));
                }
                if self
                    .storage
                    .get_share(&requested)
                    .await
                    .ok()
                    .flatten()
                    .is_some()
                {
                    return Err(RelayError::DuplicateShare(requested));
                }
                requested
            }
            None => generate_share_id(),
        };

        let share = ShareSession::new(share_id.clone(), client_id.to_string());
        self.storage
            .put_share(&share, self.config.ttl_share_session)
            .await
            .map_err(|err| {
                error!(%err, share_id, "failed to persist share");
                RelayError::ServiceUnavailable("share store unavailable".into())
            })?;

        self.set_client_share(client_id, Some(share_id.clone())).await;
        self.publish(
            Channel::ShareCreated,
            ShareAnnounce {
                share_id: share_id.clone(),
                client_id: client_id.to_string(),
                node_id: self.node_id().to_string(),
            },
        )
        .await;

        self.coordinator
            .route_to_client(
                client_id,
                ServerEvent::ConnectionReady {
                    share_id: share_id.clone(),
                    connected_clients: 1,
                    message: "Share created, waiting for a peer".into(),
                },
            )
            .await;

        info!(share_id, client_id, "share created");
        Ok(share)
    }

    pub async fn join_share(&self, share_id: &str, client_id: &str) -> RelayResult<ShareSession> {
        if client_id.is_empty() || share_id.is_empty() {
            return Err(RelayError::BadRequest(
                "shareId and clientId are required".into(),
            ));
        }
        let mut share = self
            .storage
            .get_share(share_id)
            .await
            .map_err(|err| {
                error!(%err, "share lookup failed");
                RelayError::ServiceUnavailable("share store unavailable".into())
            })?
            .ok_or_else(|| RelayError::NotFound(format!("share session {share_id} not found")))?;

        if share.status == ShareStatus::Inactive {
            return Err(RelayError::Conflict("share session is inactive".into()));
        }
        if share.has_client(client_id) {
            // Rejoin after reconnect; just reaffirm readiness.
            self.emit_ready(&share).await;
            return Ok(share);
        }
        if share.is_full() {
            return Err(RelayError::ShareFull);
        }

        let session = latest_session(self.storage.as_ref(), client_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| RelayError::BadRequest("client is not registered".into()))?;
        if let Some(existing) = &session.share_id {
            return Err(RelayError::Conflict(format!(
                "client already belongs to share {existing}"
            )));
        }

        share.clients.push(client_id.to_string());
        share.last_activity_ms = now_ms();
        self.storage
            .put_share(&share, self.config.ttl_share_session)
            .await
            .map_err(|err| {
                error!(%err, share_id, "failed to persist share join");
                RelayError::ServiceUnavailable("share store unavailable".into())
            })?;
        self.set_client_share(client_id, Some(share_id.to_string())).await;

        // Each participant learns about the other exactly once.
        for member in &share.clients {
            if let Some(peer) = share.peer_of(member) {
                self.coordinator
                    .route_to_client(
                        member,
                        ServerEvent::ClientJoinedShare {
                            client_id: peer.to_string(),
                            share_id: share_id.to_string(),
                        },
                    )
                    .await;
            }
        }
        self.emit_ready(&share).await;

        info!(share_id, client_id, "client joined share");
        Ok(share)
    }

    async fn emit_ready(&self, share: &ShareSession) {
        let message = if share.clients.len() < 2 {
            "Share created, waiting for a peer"
        } else {
            "Peer connected, ready to transfer"
        };
        for member in &share.clients {
            self.coordinator
                .route_to_client(
                    member,
                    ServerEvent::ConnectionReady {
                        share_id: share.share_id.clone(),
                        connected_clients: share.clients.len() as u32,
                        message: message.into(),
                    },
                )
                .await;
        }
    }

    // ── Disconnect ──────────────────────────────────────────────

    pub async fn disconnect(&self, client_id: &str, socket_id: &str) {
        let session = self
            .storage
            .get_session(client_id, socket_id)
            .await
            .ok()
            .flatten();

        if let Some(mut session) = session {
            session.connected = false;
            if let Err(err) = self
                .storage
                .put_session(&session, self.config.ttl_client_session)
                .await
            {
                warn!(%err, client_id, "failed to deactivate session");
            }
            if let Some(share_id) = session.share_id.clone() {
                self.leave_share(&share_id, client_id).await;
            }
        }

        self.publish(
            Channel::SessionEnded,
            SessionAnnounce {
                client_id: client_id.to_string(),
                node_id: self.node_id().to_string(),
                socket_id: socket_id.to_string(),
            },
        )
        .await;
        info!(client_id, socket_id, "client disconnected");
    }

    async fn leave_share(&self, share_id: &str, client_id: &str) {
        let Some(mut share) = self.storage.get_share(share_id).await.ok().flatten() else {
            return;
        };
        share.clients.retain(|c| c != client_id);
        share.last_activity_ms = now_ms();
        if share.clients.is_empty() {
            if let Err(err) = self.storage.delete_share(share_id).await {
                warn!(%err, share_id, "failed to delete emptied share");
            }
            info!(share_id, "share deleted, no participants left");
            return;
        }
        if let Err(err) = self
            .storage
            .put_share(&share, self.config.ttl_share_session)
            .await
        {
            warn!(%err, share_id, "failed to persist share leave");
        }
        for member in &share.clients {
            self.coordinator
                .route_to_client(
                    member,
                    ServerEvent::ClientDisconnectedFromShare {
                        client_id: client_id.to_string(),
                        share_id: share_id.to_string(),
                    },
                )
                .await;
        }
    }

    async fn set_client_share(&self, client_id: &str, share_id: Option<String>) {
        let sessions = match self.storage.sessions_for_client(client_id).await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(%err, client_id, "failed to list sessions for share binding");
                return;
            }
        };
        for mut session in sessions {
            session.share_id = share_id.clone();
            if let Err(err) = self
                .storage
                .put_session(&session, self.config.ttl_client_session)
                .await
            {
                warn!(%err, client_id, "failed to bind share to session");
            }
        }
    }
}

fn generate_share_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("share-{}-{}", now_ms(), suffix)
}
