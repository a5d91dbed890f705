use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::config::RedisConfig;
use crate::model::{now_ms, ClientSession, NodeRecord, RateLimitDecision, ShareSession, UploadState};
use crate::storage::{Storage, MASTER_LOCK_KEY};

const NODES_INDEX: &str = "nodes:index";
const SESSIONS_INDEX: &str = "sessions:all";
const UPLOADS_INDEX: &str = "uploads:index";

fn node_key(node_id: &str) -> String {
    format!("node:{node_id}")
}

fn session_key(client_id: &str, socket_id: &str) -> String {
    format!("session:{client_id}:{socket_id}")
}

fn client_sessions_key(client_id: &str) -> String {
    format!("sessions:client:{client_id}")
}

fn node_sessions_key(node_id: &str) -> String {
    format!("sessions:node:{node_id}")
}

fn share_key(share_id: &str) -> String {
    format!("share:{share_id}")
}

fn upload_key(file_id: &str) -> String {
    format!("upload:{file_id}")
}

fn cancelled_key(file_id: &str) -> String {
    format!("cancelled:{file_id}")
}

fn rate_key(key: &str) -> String {
    format!("rate:{key}")
}

fn counter_key(name: &str) -> String {
    format!("counter:{name}")
}

fn session_member(client_id: &str, socket_id: &str) -> String {
    format!("{client_id}|{socket_id}")
}

fn split_session_member(member: &str) -> Option<(&str, &str)> {
    member.split_once('|')
}

/// Distributed backend over Redis. Records are JSON blobs with native key
/// TTLs; membership structures are Redis sets; the leader lock is a single
/// `SET NX EX`. Index sets may hold stale members after key expiry; readers
/// drop them lazily.
pub struct RedisStorage {
    conn: ConnectionManager,
}

impl RedisStorage {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .context("invalid redis connection url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, json, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    warn!(key, %err, "dropping undecodable record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn index_add(&self, index: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(index, member).await?;
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(index, member).await?;
        Ok(())
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(index).await?;
        Ok(members)
    }

    /// Fetch a session by index member, pruning the indexes when the
    /// underlying key has expired.
    async fn fetch_session_member(&self, member: &str) -> Result<Option<ClientSession>> {
        let Some((client_id, socket_id)) = split_session_member(member) else {
            return Ok(None);
        };
        let session: Option<ClientSession> =
            self.get_json(&session_key(client_id, socket_id)).await?;
        if session.is_none() {
            self.index_remove(SESSIONS_INDEX, member).await.ok();
            self.index_remove(&client_sessions_key(client_id), socket_id)
                .await
                .ok();
        }
        Ok(session)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn put_node(&self, node: &NodeRecord) -> Result<()> {
        let json = serde_json::to_string(node)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(node_key(&node.id), json).await?;
        self.index_add(NODES_INDEX, &node.id).await
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        self.get_json(&node_key(node_id)).await
    }

    async fn find_node_by_endpoint(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<NodeRecord>> {
        for node_id in self.index_members(NODES_INDEX).await? {
            if let Some(node) = self.get_json::<NodeRecord>(&node_key(&node_id)).await? {
                if node.hostname == hostname && node.port == port {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        for node_id in self.index_members(NODES_INDEX).await? {
            match self.get_json::<NodeRecord>(&node_key(&node_id)).await? {
                Some(node) => nodes.push(node),
                None => self.index_remove(NODES_INDEX, &node_id).await.ok().unwrap_or(()),
            }
        }
        Ok(nodes)
    }

    async fn put_session(&self, session: &ClientSession, ttl: Duration) -> Result<()> {
        let key = session_key(&session.client_id, &session.socket_id);
        self.put_json(&key, session, ttl).await?;
        let member = session_member(&session.client_id, &session.socket_id);
        let mut conn = self.conn.clone();
        let _: () = conn
            .sadd(client_sessions_key(&session.client_id), &session.socket_id)
            .await?;
        let _: () = conn
            .expire(
                client_sessions_key(&session.client_id),
                ttl.as_secs().max(1) as i64,
            )
            .await?;
        let _: () = conn.sadd(node_sessions_key(&session.node_id), &member).await?;
        let _: () = conn
            .expire(
                node_sessions_key(&session.node_id),
                ttl.as_secs().max(1) as i64,
            )
            .await?;
        self.index_add(SESSIONS_INDEX, &member).await
    }

    async fn get_session(
        &self,
        client_id: &str,
        socket_id: &str,
    ) -> Result<Option<ClientSession>> {
        self.get_json(&session_key(client_id, socket_id)).await
    }

    async fn sessions_for_client(&self, client_id: &str) -> Result<Vec<ClientSession>> {
        let mut sessions = Vec::new();
        for socket_id in self.index_members(&client_sessions_key(client_id)).await? {
            match self
                .get_json::<ClientSession>(&session_key(client_id, &socket_id))
                .await?
            {
                Some(session) => sessions.push(session),
                None => {
                    self.index_remove(&client_sessions_key(client_id), &socket_id)
                        .await
                        .ok();
                }
            }
        }
        Ok(sessions)
    }

    async fn sessions_on_node(&self, node_id: &str) -> Result<Vec<ClientSession>> {
        let mut sessions = Vec::new();
        for member in self.index_members(&node_sessions_key(node_id)).await? {
            if let Some(session) = self.fetch_session_member(&member).await? {
                if session.node_id == node_id {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn delete_session(&self, client_id: &str, socket_id: &str) -> Result<()> {
        let session: Option<ClientSession> = self.get_session(client_id, socket_id).await?;
        let mut conn = self.conn.clone();
        let _: () = conn.del(session_key(client_id, socket_id)).await?;
        self.index_remove(&client_sessions_key(client_id), socket_id)
            .await?;
        self.index_remove(SESSIONS_INDEX, &session_member(client_id, socket_id))
            .await?;
        if let Some(session) = session {
            self.index_remove(
                &node_sessions_key(&session.node_id),
                &session_member(client_id, socket_id),
            )
            .await?;
        }
        Ok(())
    }

    async fn count_connected_sessions(&self) -> Result<u64> {
        let mut count = 0u64;
        for member in self.index_members(SESSIONS_INDEX).await? {
            if let Some(session) = self.fetch_session_member(&member).await? {
                if session.connected {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn put_share(&self, share: &ShareSession, ttl: Duration) -> Result<()> {
        self.put_json(&share_key(&share.share_id), share, ttl).await
    }

    async fn get_share(&self, share_id: &str) -> Result<Option<ShareSession>> {
        self.get_json(&share_key(share_id)).await
    }

    async fn delete_share(&self, share_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(share_key(share_id)).await?;
        Ok(())
    }

    async fn put_upload(&self, state: &UploadState, ttl: Duration) -> Result<()> {
        self.put_json(&upload_key(&state.file_id), state, ttl).await?;
        self.index_add(UPLOADS_INDEX, &state.file_id).await
    }

    async fn get_upload(&self, file_id: &str) -> Result<Option<UploadState>> {
        self.get_json(&upload_key(file_id)).await
    }

    async fn delete_upload(&self, file_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(upload_key(file_id)).await?;
        self.index_remove(UPLOADS_INDEX, file_id).await
    }

    async fn list_uploads(&self) -> Result<Vec<UploadState>> {
        let mut uploads = Vec::new();
        for file_id in self.index_members(UPLOADS_INDEX).await? {
            match self.get_json::<UploadState>(&upload_key(&file_id)).await? {
                Some(state) => uploads.push(state),
                None => self.index_remove(UPLOADS_INDEX, &file_id).await.ok().unwrap_or(()),
            }
        }
        Ok(uploads)
    }

    async fn add_cancelled_download(
        &self,
        file_id: &str,
        client_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = cancelled_key(file_id);
        let _: () = conn.sadd(&key, client_id).await?;
        let _: () = conn.expire(&key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn is_download_cancelled(&self, file_id: &str, client_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let cancelled: bool = conn.sismember(cancelled_key(file_id), client_id).await?;
        Ok(cancelled)
    }

    async fn clear_cancelled_downloads(&self, file_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(cancelled_key(file_id)).await?;
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        max: u32,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.conn.clone();
        let key = rate_key(key);
        let count: u32 = conn.incr(&key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(&key, window.as_secs().max(1) as i64).await?;
        }
        let ttl_secs: i64 = conn.ttl(&key).await?;
        let reset_in_ms = if ttl_secs > 0 {
            ttl_secs as u64 * 1000
        } else {
            window.as_millis() as u64
        };
        Ok(RateLimitDecision {
            allowed: count <= max,
            remaining: max.saturating_sub(count),
            reset_at_ms: now_ms() + reset_in_ms,
        })
    }

    async fn try_acquire_master_lock(&self, node_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(MASTER_LOCK_KEY)
            .arg(node_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn refresh_master_lock(&self, node_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(MASTER_LOCK_KEY).await?;
        if holder.as_deref() == Some(node_id) {
            let _: () = conn
                .expire(MASTER_LOCK_KEY, ttl.as_secs().max(1) as i64)
                .await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn current_master(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(MASTER_LOCK_KEY).await?;
        Ok(holder)
    }

    async fn incr_counter(&self, name: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = conn.incr(counter_key(name), 1).await?;
        Ok(value)
    }

    async fn get_counter(&self, name: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(counter_key(name)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn sweep_expired(&self) -> Result<()> {
        // Redis expires keys natively; nothing to do.
        Ok(())
    }
}
