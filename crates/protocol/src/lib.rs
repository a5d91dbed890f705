use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serialized pub/sub payloads above this size trigger an operational
/// warning at the publisher. Not a hard cap.
pub const PAYLOAD_WARN_BYTES: usize = 500 * 1024;

// ── Binary envelope ─────────────────────────────────────────────

/// Raw chunk bytes crossing a JSON boundary. Encodes as a tagged
/// `{"_base64": "..."}` object so binary survives every hop between the
/// browser, the relay, and the cluster bus, and decodes symmetrically.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct Base64Envelope {
    _base64: String,
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Base64Envelope {
            _base64: B64.encode(&self.0),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = Base64Envelope::deserialize(deserializer)?;
        let bytes = B64
            .decode(envelope._base64.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

// ── Cluster roles ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    pub fn is_master(self) -> bool {
        matches!(self, NodeRole::Master)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
        }
    }
}

// ── Client -> server events ─────────────────────────────────────

/// Everything a connected client may send over the event channel. An
/// unrecognized discriminant lands in `Unknown` and is logged, not fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "register", rename_all = "camelCase")]
    Register { client_id: String },

    #[serde(rename = "heartbeat", rename_all = "camelCase")]
    Heartbeat { client_id: String },

    #[serde(rename = "upload-init", rename_all = "camelCase")]
    UploadInit {
        client_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
    },

    #[serde(rename = "upload-chunk", rename_all = "camelCase")]
    UploadChunk {
        client_id: String,
        file_id: String,
        chunk_index: u32,
        chunk: Base64Bytes,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },

    #[serde(rename = "chunk-acknowledged", rename_all = "camelCase")]
    ChunkAcknowledged {
        client_id: String,
        file_id: String,
        chunk_index: u32,
    },

    #[serde(rename = "download-confirmed", rename_all = "camelCase")]
    DownloadConfirmed {
        client_id: String,
        file_id: String,
        file_name: String,
        share_id: String,
    },

    #[serde(rename = "cancel-download", rename_all = "camelCase")]
    CancelDownload { client_id: String, file_id: String },

    #[serde(other)]
    Unknown,
}

/// Inbound frame: an event plus an optional `seq` the server echoes in its
/// ack. The `upload-chunk` ack doubles as the sender's flow-control gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

// ── Server -> client events ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "ack", rename_all = "camelCase")]
    Ack {
        seq: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "registered", rename_all = "camelCase")]
    Registered {
        node_id: String,
        is_master: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        master_id: Option<String>,
    },

    #[serde(rename = "heartbeat-ack", rename_all = "camelCase")]
    HeartbeatAck { timestamp_ms: u64 },

    #[serde(rename = "upload-init-response", rename_all = "camelCase")]
    UploadInitResponse { file_id: String, resume_from: u32 },

    #[serde(rename = "chunk-uploaded", rename_all = "camelCase")]
    ChunkUploaded {
        file_id: String,
        chunk_index: u32,
        progress: u8,
        uploaded_chunks: u32,
        total_chunks: u32,
    },

    #[serde(rename = "upload-complete", rename_all = "camelCase")]
    UploadComplete {
        file_id: String,
        file_name: String,
        file_size: u64,
        duration_ms: u64,
    },

    #[serde(rename = "file-transfer-started", rename_all = "camelCase")]
    FileTransferStarted {
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },

    #[serde(rename = "chunk-received", rename_all = "camelCase")]
    ChunkReceived {
        file_id: String,
        chunk_index: u32,
        chunk: Base64Bytes,
        total_chunks: u32,
    },

    #[serde(rename = "chunk-acknowledged", rename_all = "camelCase")]
    ChunkAcknowledged { file_id: String, chunk_index: u32 },

    #[serde(rename = "chunk-retry", rename_all = "camelCase")]
    ChunkRetry {
        file_id: String,
        chunk_index: u32,
        attempt: u32,
    },

    #[serde(rename = "transfer-failed", rename_all = "camelCase")]
    TransferFailed {
        file_id: String,
        reason: String,
        failed_chunks: Vec<u32>,
    },

    #[serde(rename = "download-confirmed", rename_all = "camelCase")]
    DownloadConfirmed { file_id: String, file_name: String },

    #[serde(rename = "download-cancelled", rename_all = "camelCase")]
    DownloadCancelled { file_id: String },

    #[serde(rename = "client-joined-share", rename_all = "camelCase")]
    ClientJoinedShare { client_id: String, share_id: String },

    #[serde(rename = "client-disconnected-from-share", rename_all = "camelCase")]
    ClientDisconnectedFromShare { client_id: String, share_id: String },

    #[serde(rename = "connection-ready", rename_all = "camelCase")]
    ConnectionReady {
        share_id: String,
        connected_clients: u32,
        message: String,
    },

    #[serde(rename = "cluster-role-change", rename_all = "camelCase")]
    ClusterRoleChange {
        node_id: String,
        role: NodeRole,
        is_master: bool,
    },

    #[serde(rename = "rate-limited", rename_all = "camelCase")]
    RateLimited { reset_at_ms: u64 },
}

impl ServerEvent {
    /// Wire name of the discriminant, for logs and routing diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::Registered { .. } => "registered",
            ServerEvent::HeartbeatAck { .. } => "heartbeat-ack",
            ServerEvent::UploadInitResponse { .. } => "upload-init-response",
            ServerEvent::ChunkUploaded { .. } => "chunk-uploaded",
            ServerEvent::UploadComplete { .. } => "upload-complete",
            ServerEvent::FileTransferStarted { .. } => "file-transfer-started",
            ServerEvent::ChunkReceived { .. } => "chunk-received",
            ServerEvent::ChunkAcknowledged { .. } => "chunk-acknowledged",
            ServerEvent::ChunkRetry { .. } => "chunk-retry",
            ServerEvent::TransferFailed { .. } => "transfer-failed",
            ServerEvent::DownloadConfirmed { .. } => "download-confirmed",
            ServerEvent::DownloadCancelled { .. } => "download-cancelled",
            ServerEvent::ClientJoinedShare { .. } => "client-joined-share",
            ServerEvent::ClientDisconnectedFromShare { .. } => "client-disconnected-from-share",
            ServerEvent::ConnectionReady { .. } => "connection-ready",
            ServerEvent::ClusterRoleChange { .. } => "cluster-role-change",
            ServerEvent::RateLimited { .. } => "rate-limited",
        }
    }
}

// ── Cluster bus payloads ────────────────────────────────────────

/// Named pub/sub channels of the cluster bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    SessionCreated,
    SessionEnded,
    ShareCreated,
    MessageRoute,
    RoutingRequest,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::SessionCreated => "session:created",
            Channel::SessionEnded => "session:ended",
            Channel::ShareCreated => "share:created",
            Channel::MessageRoute => "message:route",
            Channel::RoutingRequest => "routing:request",
        }
    }

    pub fn all() -> [Channel; 5] {
        [
            Channel::SessionCreated,
            Channel::SessionEnded,
            Channel::ShareCreated,
            Channel::MessageRoute,
            Channel::RoutingRequest,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnnounce {
    pub client_id: String,
    pub node_id: String,
    pub socket_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareAnnounce {
    pub share_id: String,
    pub client_id: String,
    pub node_id: String,
}

/// Direct node-to-node delivery. Consumers act only when
/// `target_node_id` names them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMessage {
    pub target_node_id: String,
    pub target_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    pub event: ServerEvent,
}

/// Worker fallback: only the current master consumes these and fans the
/// event out over every known session of the target client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRequest {
    pub target_client_id: String,
    pub event: ServerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_envelope_round_trips_binary() {
        let raw = Base64Bytes(vec![0u8, 255, 13, 10, 128, 7]);
        let json = serde_json::to_string(&raw).unwrap();
        assert!(json.contains("_base64"), "must use the tagged envelope");
        let back: Base64Bytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn client_frame_carries_seq_beside_tagged_event() {
        let json = r#"{"type":"upload-chunk","seq":7,"clientId":"c1","fileId":"f1","chunkIndex":2,"chunk":{"_base64":"AAECAw=="}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.seq, Some(7));
        match frame.event {
            ClientEvent::UploadChunk {
                file_id,
                chunk_index,
                chunk,
                ..
            } => {
                assert_eq!(file_id, "f1");
                assert_eq!(chunk_index, 2);
                assert_eq!(chunk.as_slice(), &[0, 1, 2, 3]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_discriminant_is_tolerated() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"webrtc-offer","sdp":"..."}"#).unwrap();
        assert!(matches!(frame.event, ClientEvent::Unknown));
    }

    #[test]
    fn server_events_use_wire_names() {
        let event = ServerEvent::ChunkRetry {
            file_id: "f".into(),
            chunk_index: 1,
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk-retry""#));
        assert!(json.contains(r#""chunkIndex":1"#));
        assert_eq!(event.name(), "chunk-retry");
    }

    #[test]
    fn route_message_round_trips_chunk_payload() {
        let msg = RouteMessage {
            target_node_id: "n2".into(),
            target_client_id: "bob".into(),
            socket_id: Some("s9".into()),
            event: ServerEvent::ChunkReceived {
                file_id: "f1".into(),
                chunk_index: 0,
                chunk: Base64Bytes(vec![1, 2, 3]),
                total_chunks: 3,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RouteMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target_node_id, "n2");
        match back.event {
            ServerEvent::ChunkReceived { chunk, .. } => assert_eq!(chunk.as_slice(), &[1, 2, 3]),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
