use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{now_ms, ClientSession, NodeRecord, RateLimitDecision, ShareSession, UploadState};
use crate::storage::Storage;

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

struct RateWindow {
    count: u32,
    window_ends: Instant,
    reset_at_ms: u64,
}

struct MasterLease {
    node_id: String,
    expires_at: Instant,
}

/// Embedded backend: in-process maps with expiry stamps checked on access
/// and purged by the sweep loop. Shared between engines in one process to
/// model a cluster without a real store.
#[derive(Default)]
pub struct MemoryStorage {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    sessions: RwLock<HashMap<(String, String), Entry<ClientSession>>>,
    shares: RwLock<HashMap<String, Entry<ShareSession>>>,
    uploads: RwLock<HashMap<String, Entry<UploadState>>>,
    cancelled: RwLock<HashMap<String, Entry<HashSet<String>>>>,
    rate: RwLock<HashMap<String, RateWindow>>,
    counters: RwLock<HashMap<String, u64>>,
    master: RwLock<Option<MasterLease>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_node(&self, node: &NodeRecord) -> Result<()> {
        self.nodes
            .write()
            .await
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.nodes.read().await.get(node_id).cloned())
    }

    async fn find_node_by_endpoint(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<NodeRecord>> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .find(|n| n.hostname == hostname && n.port == port)
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn put_session(&self, session: &ClientSession, ttl: Duration) -> Result<()> {
        let key = (session.client_id.clone(), session.socket_id.clone());
        self.sessions
            .write()
            .await
            .insert(key, Entry::new(session.clone(), ttl));
        Ok(())
    }

    async fn get_session(
        &self,
        client_id: &str,
        socket_id: &str,
    ) -> Result<Option<ClientSession>> {
        let key = (client_id.to_string(), socket_id.to_string());
        Ok(self
            .sessions
            .read()
            .await
            .get(&key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn sessions_for_client(&self, client_id: &str) -> Result<Vec<ClientSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .iter()
            .filter(|((cid, _), e)| cid == client_id && e.live())
            .map(|(_, e)| e.value.clone())
            .collect())
    }

    async fn sessions_on_node(&self, node_id: &str) -> Result<Vec<ClientSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|e| e.live() && e.value.node_id == node_id)
            .map(|e| e.value.clone())
            .collect())
    }

    async fn delete_session(&self, client_id: &str, socket_id: &str) -> Result<()> {
        let key = (client_id.to_string(), socket_id.to_string());
        self.sessions.write().await.remove(&key);
        Ok(())
    }

    async fn count_connected_sessions(&self) -> Result<u64> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|e| e.live() && e.value.connected)
            .count() as u64)
    }

    async fn put_share(&self, share: &ShareSession, ttl: Duration) -> Result<()> {
        self.shares
            .write()
            .await
            .insert(share.share_id.clone(), Entry::new(share.clone(), ttl));
        Ok(())
    }

    async fn get_share(&self, share_id: &str) -> Result<Option<ShareSession>> {
        Ok(self
            .shares
            .read()
            .await
            .get(share_id)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn delete_share(&self, share_id: &str) -> Result<()> {
        self.shares.write().await.remove(share_id);
        Ok(())
    }

    async fn put_upload(&self, state: &UploadState, ttl: Duration) -> Result<()> {
        self.uploads
            .write()
            .await
            .insert(state.file_id.clone(), Entry::new(state.clone(), ttl));
        Ok(())
    }

    async fn get_upload(&self, file_id: &str) -> Result<Option<UploadState>> {
        Ok(self
            .uploads
            .read()
            .await
            .get(file_id)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn delete_upload(&self, file_id: &str) -> Result<()> {
        self.uploads.write().await.remove(file_id);
        Ok(())
    }

    async fn list_uploads(&self) -> Result<Vec<UploadState>> {
        Ok(self
            .uploads
            .read()
            .await
            .values()
            .filter(|e| e.live())
            .map(|e| e.value.clone())
            .collect())
    }

    async fn add_cancelled_download(
        &self,
        file_id: &str,
        client_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut cancelled = self.cancelled.write().await;
        match cancelled.get_mut(file_id) {
            Some(entry) if entry.live() => {
                entry.value.insert(client_id.to_string());
            }
            _ => {
                let mut set = HashSet::new();
                set.insert(client_id.to_string());
                cancelled.insert(file_id.to_string(), Entry::new(set, ttl));
            }
        }
        Ok(())
    }

    async fn is_download_cancelled(&self, file_id: &str, client_id: &str) -> Result<bool> {
        Ok(self
            .cancelled
            .read()
            .await
            .get(file_id)
            .filter(|e| e.live())
            .map(|e| e.value.contains(client_id))
            .unwrap_or(false))
    }

    async fn clear_cancelled_downloads(&self, file_id: &str) -> Result<()> {
        self.cancelled.write().await.remove(file_id);
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        max: u32,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        let mut rate = self.rate.write().await;
        let now = Instant::now();
        let entry = rate.entry(key.to_string()).or_insert_with(|| RateWindow {
            count: 0,
            window_ends: now + window,
            reset_at_ms: now_ms() + window.as_millis() as u64,
        });
        if now >= entry.window_ends {
            entry.count = 0;
            entry.window_ends = now + window;
            entry.reset_at_ms = now_ms() + window.as_millis() as u64;
        }
        entry.count += 1;
        let allowed = entry.count <= max;
        Ok(RateLimitDecision {
            allowed,
            remaining: max.saturating_sub(entry.count),
            reset_at_ms: entry.reset_at_ms,
        })
    }

    async fn try_acquire_master_lock(&self, node_id: &str, ttl: Duration) -> Result<bool> {
        let mut master = self.master.write().await;
        let now = Instant::now();
        match master.as_ref() {
            Some(lease) if lease.expires_at > now => Ok(false),
            _ => {
                *master = Some(MasterLease {
                    node_id: node_id.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn refresh_master_lock(&self, node_id: &str, ttl: Duration) -> Result<bool> {
        let mut master = self.master.write().await;
        let now = Instant::now();
        match master.as_mut() {
            Some(lease) if lease.expires_at > now && lease.node_id == node_id => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_master(&self) -> Result<Option<String>> {
        let master = self.master.read().await;
        Ok(master
            .as_ref()
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.node_id.clone()))
    }

    async fn incr_counter(&self, name: &str) -> Result<u64> {
        let mut counters = self.counters.write().await;
        let value = counters.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn get_counter(&self, name: &str) -> Result<u64> {
        Ok(self.counters.read().await.get(name).copied().unwrap_or(0))
    }

    async fn sweep_expired(&self) -> Result<()> {
        self.sessions.write().await.retain(|_, e| e.live());
        self.shares.write().await.retain(|_, e| e.live());
        self.uploads.write().await.retain(|_, e| e.live());
        self.cancelled.write().await.retain(|_, e| e.live());
        let now = Instant::now();
        self.rate.write().await.retain(|_, w| w.window_ends > now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn master_lock_is_exclusive_until_expiry() {
        let storage = MemoryStorage::new();
        let ttl = Duration::from_millis(50);
        assert!(storage.try_acquire_master_lock("n1", ttl).await.unwrap());
        assert!(!storage.try_acquire_master_lock("n2", ttl).await.unwrap());
        assert_eq!(storage.current_master().await.unwrap().as_deref(), Some("n1"));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(storage.current_master().await.unwrap(), None);
        assert!(storage.try_acquire_master_lock("n2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_only_extends_own_lease() {
        let storage = MemoryStorage::new();
        let ttl = Duration::from_millis(80);
        assert!(storage.try_acquire_master_lock("n1", ttl).await.unwrap());
        assert!(storage.refresh_master_lock("n1", ttl).await.unwrap());
        assert!(!storage.refresh_master_lock("n2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_counts_within_fixed_window() {
        let storage = MemoryStorage::new();
        let window = Duration::from_millis(60);
        for _ in 0..3 {
            let d = storage.check_rate_limit("hb:alice", 3, window).await.unwrap();
            assert!(d.allowed);
        }
        let denied = storage.check_rate_limit("hb:alice", 3, window).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.reset_at_ms > 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh = storage.check_rate_limit("hb:alice", 3, window).await.unwrap();
        assert!(fresh.allowed, "new window must reset the counter");
    }

    #[tokio::test]
    async fn expired_sessions_vanish_on_read_and_sweep() {
        let storage = MemoryStorage::new();
        let session = ClientSession::new("alice".into(), "s1".into(), "n1".into());
        storage
            .put_session(&session, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(storage.get_session("alice", "s1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(storage.get_session("alice", "s1").await.unwrap().is_none());
        storage.sweep_expired().await.unwrap();
        assert!(storage.sessions_for_client("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_downloads_are_idempotent_set_inserts() {
        let storage = MemoryStorage::new();
        let ttl = Duration::from_secs(5);
        storage.add_cancelled_download("f1", "bob", ttl).await.unwrap();
        storage.add_cancelled_download("f1", "bob", ttl).await.unwrap();
        assert!(storage.is_download_cancelled("f1", "bob").await.unwrap());
        assert!(!storage.is_download_cancelled("f1", "carol").await.unwrap());
        storage.clear_cancelled_downloads("f1").await.unwrap();
        assert!(!storage.is_download_cancelled("f1", "bob").await.unwrap());
    }
}
