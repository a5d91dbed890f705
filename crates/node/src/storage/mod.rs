pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{ClientSession, NodeRecord, RateLimitDecision, ShareSession, UploadState};

pub const MASTER_LOCK_KEY: &str = "cluster:master";
pub const FILES_SENT_COUNTER: &str = "filesSent";
pub const USERS_JOINED_COUNTER: &str = "usersJoined";

/// Unified key-spaced store behind both the embedded and the Redis backend.
/// Callers on hot paths treat write errors as log-and-continue; the
/// ack/retry machinery absorbs any resulting loss.
#[async_trait]
pub trait Storage: Send + Sync {
    // nodes
    async fn put_node(&self, node: &NodeRecord) -> Result<()>;
    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>>;
    async fn find_node_by_endpoint(&self, hostname: &str, port: u16)
        -> Result<Option<NodeRecord>>;
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    // client sessions
    async fn put_session(&self, session: &ClientSession, ttl: Duration) -> Result<()>;
    async fn get_session(&self, client_id: &str, socket_id: &str)
        -> Result<Option<ClientSession>>;
    async fn sessions_for_client(&self, client_id: &str) -> Result<Vec<ClientSession>>;
    async fn sessions_on_node(&self, node_id: &str) -> Result<Vec<ClientSession>>;
    async fn delete_session(&self, client_id: &str, socket_id: &str) -> Result<()>;
    async fn count_connected_sessions(&self) -> Result<u64>;

    // share sessions
    async fn put_share(&self, share: &ShareSession, ttl: Duration) -> Result<()>;
    async fn get_share(&self, share_id: &str) -> Result<Option<ShareSession>>;
    async fn delete_share(&self, share_id: &str) -> Result<()>;

    // upload state
    async fn put_upload(&self, state: &UploadState, ttl: Duration) -> Result<()>;
    async fn get_upload(&self, file_id: &str) -> Result<Option<UploadState>>;
    async fn delete_upload(&self, file_id: &str) -> Result<()>;
    async fn list_uploads(&self) -> Result<Vec<UploadState>>;

    // cancelled downloads
    async fn add_cancelled_download(
        &self,
        file_id: &str,
        client_id: &str,
        ttl: Duration,
    ) -> Result<()>;
    async fn is_download_cancelled(&self, file_id: &str, client_id: &str) -> Result<bool>;
    async fn clear_cancelled_downloads(&self, file_id: &str) -> Result<()>;

    // rate limiting: atomic fixed-window counter
    async fn check_rate_limit(
        &self,
        key: &str,
        max: u32,
        window: Duration,
    ) -> Result<RateLimitDecision>;

    // cluster master lock
    async fn try_acquire_master_lock(&self, node_id: &str, ttl: Duration) -> Result<bool>;
    async fn refresh_master_lock(&self, node_id: &str, ttl: Duration) -> Result<bool>;
    async fn current_master(&self) -> Result<Option<String>>;

    // persistent counters
    async fn incr_counter(&self, name: &str) -> Result<u64>;
    async fn get_counter(&self, name: &str) -> Result<u64>;

    /// Purge entries whose TTL has lapsed. Redis expires keys natively, so
    /// only the embedded backend does real work here.
    async fn sweep_expired(&self) -> Result<()>;
}

pub type SharedStorage = Arc<dyn Storage>;

/// The latest connected session of a client, preferring live sockets.
pub async fn latest_session(
    storage: &dyn Storage,
    client_id: &str,
) -> Result<Option<ClientSession>> {
    let mut sessions = storage.sessions_for_client(client_id).await?;
    sessions.sort_by_key(|s| s.last_heartbeat_ms);
    let connected = sessions.iter().rev().find(|s| s.connected).cloned();
    Ok(connected.or_else(|| sessions.pop()))
}
