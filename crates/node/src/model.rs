use std::collections::{BTreeMap, BTreeSet, HashSet};

use beamdrop_protocol::NodeRole;
use serde::{Deserialize, Serialize};

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

// ── Cluster nodes ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Dead,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub status: NodeStatus,
    pub role: NodeRole,
    pub last_heartbeat_ms: u64,
}

impl NodeRecord {
    pub fn new(hostname: String, port: u16) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hostname,
            port,
            status: NodeStatus::Active,
            role: NodeRole::Worker,
            last_heartbeat_ms: now_ms(),
        }
    }

    pub fn is_stale(&self, now: u64, stale_after_ms: u64) -> bool {
        self.status == NodeStatus::Active && now.saturating_sub(self.last_heartbeat_ms) > stale_after_ms
    }
}

// ── Client sessions ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSession {
    pub client_id: String,
    pub socket_id: String,
    pub node_id: String,
    pub connected: bool,
    pub last_heartbeat_ms: u64,
    #[serde(default)]
    pub uploads: HashSet<String>,
    #[serde(default)]
    pub downloads: HashSet<String>,
    #[serde(default)]
    pub upload_speed: f64,
    #[serde(default)]
    pub download_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
}

impl ClientSession {
    pub fn new(client_id: String, socket_id: String, node_id: String) -> Self {
        Self {
            client_id,
            socket_id,
            node_id,
            connected: true,
            last_heartbeat_ms: now_ms(),
            uploads: HashSet::new(),
            downloads: HashSet::new(),
            upload_speed: 0.0,
            download_speed: 0.0,
            share_id: None,
        }
    }

    /// Uploads plus downloads; bounded by the transfer budget.
    pub fn transfer_count(&self) -> usize {
        self.uploads.len() + self.downloads.len()
    }
}

// ── Share sessions ──────────────────────────────────────────────

pub const SHARE_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareSession {
    pub share_id: String,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub clients: Vec<String>,
    pub status: ShareStatus,
}

impl ShareSession {
    pub fn new(share_id: String, creator: String) -> Self {
        let now = now_ms();
        Self {
            share_id,
            created_at_ms: now,
            last_activity_ms: now,
            clients: vec![creator],
            status: ShareStatus::Active,
        }
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= SHARE_CAPACITY
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.iter().any(|c| c == client_id)
    }

    /// The other participant, in the two-party case.
    pub fn peer_of(&self, client_id: &str) -> Option<&str> {
        self.clients
            .iter()
            .find(|c| c.as_str() != client_id)
            .map(|c| c.as_str())
    }
}

// ── Upload state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAck {
    pub timestamp_ms: u64,
    pub retries: u32,
}

/// Per-upload record. Mutated by the chunk ingest path, the ack handler,
/// and the retry scan; callers serialize writes through the engine's
/// per-file lock before touching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    /// Receivers registered at init time. Empty for a single-client share:
    /// no acks are expected and the upload completes on the last chunk.
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub uploaded_chunks: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chunk_checksums: BTreeMap<u32, String>,
    #[serde(default)]
    pub pending_acks: BTreeMap<u32, PendingAck>,
    pub status: UploadStatus,
    pub start_time_ms: u64,
    pub last_update_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ack_time_ms: Option<u64>,
}

impl UploadState {
    pub fn new(
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        client_id: String,
        share_id: Option<String>,
        receivers: Vec<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            file_id,
            file_name,
            file_size,
            total_chunks,
            client_id,
            share_id,
            receivers,
            uploaded_chunks: BTreeSet::new(),
            chunk_checksums: BTreeMap::new(),
            pending_acks: BTreeMap::new(),
            status: UploadStatus::Uploading,
            start_time_ms: now,
            last_update_ms: now,
            last_ack_time_ms: None,
        }
    }

    pub fn uploaded_count(&self) -> u32 {
        self.uploaded_chunks.len() as u32
    }

    pub fn progress_percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        ((self.uploaded_count() as u64 * 100) / self.total_chunks as u64) as u8
    }

    pub fn all_chunks_uploaded(&self) -> bool {
        self.uploaded_count() == self.total_chunks
    }

    /// Complete only once every chunk is in and nothing is awaiting an ack.
    pub fn is_completable(&self) -> bool {
        self.status == UploadStatus::Uploading
            && self.all_chunks_uploaded()
            && self.pending_acks.is_empty()
    }
}

// ── Rate limiting ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_capacity_is_two() {
        let mut share = ShareSession::new("s1".into(), "alice".into());
        assert!(!share.is_full());
        share.clients.push("bob".into());
        assert!(share.is_full());
        assert_eq!(share.peer_of("alice"), Some("bob"));
        assert_eq!(share.peer_of("bob"), Some("alice"));
    }

    #[test]
    fn upload_progress_rounds_down() {
        let mut state = UploadState::new(
            "f1".into(),
            "x".into(),
            48,
            3,
            "alice".into(),
            None,
            vec!["bob".into()],
        );
        assert_eq!(state.progress_percent(), 0);
        state.uploaded_chunks.insert(0);
        assert_eq!(state.progress_percent(), 33);
        state.uploaded_chunks.insert(1);
        assert_eq!(state.progress_percent(), 66);
        state.uploaded_chunks.insert(2);
        assert_eq!(state.progress_percent(), 100);
    }

    #[test]
    fn completion_waits_for_pending_acks() {
        let mut state = UploadState::new(
            "f1".into(),
            "x".into(),
            16,
            1,
            "alice".into(),
            None,
            vec!["bob".into()],
        );
        state.uploaded_chunks.insert(0);
        state.pending_acks.insert(
            0,
            PendingAck {
                timestamp_ms: now_ms(),
                retries: 0,
            },
        );
        assert!(!state.is_completable());
        state.pending_acks.remove(&0);
        assert!(state.is_completable());
    }

    #[test]
    fn upload_state_round_trips_set_membership() {
        let mut state = UploadState::new(
            "f1".into(),
            "x".into(),
            64,
            4,
            "alice".into(),
            Some("s1".into()),
            vec!["bob".into()],
        );
        state.uploaded_chunks.insert(2);
        state.uploaded_chunks.insert(0);
        state.pending_acks.insert(
            2,
            PendingAck {
                timestamp_ms: 1234,
                retries: 1,
            },
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: UploadState = serde_json::from_str(&json).unwrap();
        assert!(back.uploaded_chunks.contains(&0));
        assert!(back.uploaded_chunks.contains(&2));
        assert!(!back.uploaded_chunks.contains(&1));
        assert_eq!(back.pending_acks.get(&2).unwrap().retries, 1);
    }
}
