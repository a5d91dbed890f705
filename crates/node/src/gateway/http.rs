use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use beamdrop_protocol::NodeRole;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::engine::NodeEngine;
use crate::error::RelayError;
use crate::gateway::ws;
use crate::model::UploadState;
use crate::storage::{Storage, FILES_SENT_COUNTER, USERS_JOINED_COUNTER};

pub fn router(engine: Arc<NodeEngine>) -> Router {
    let cors = cors_layer(engine.config.cors_origin.as_deref());
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/cluster/nodes", get(cluster_nodes))
        .route("/api/cluster/master", get(cluster_master))
        .route("/api/cluster/stats", get(cluster_stats))
        .route("/api/share/create", post(share_create))
        .route("/api/share/join", post(share_join))
        .route("/api/uploads/:file_id", get(upload_progress))
        .route("/ws", get(ws::upgrade))
        .layer(cors)
        .with_state(engine)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    match origin.filter(|o| *o != "*").map(|o| o.parse::<HeaderValue>()) {
        Some(Ok(value)) => layer.allow_origin(value),
        Some(Err(err)) => {
            warn!(%err, "invalid CORS_ORIGIN, allowing any origin");
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}

// ── Health & stats ──────────────────────────────────────────────

async fn health(State(engine): State<Arc<NodeEngine>>) -> impl IntoResponse {
    let role = if engine.coordinator.is_master() {
        NodeRole::Master
    } else {
        NodeRole::Worker
    };
    let cluster = engine.config.use_cluster.then(|| {
        json!({
            "role": role.as_str(),
            "nodeId": engine.node_id(),
        })
    });
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "features": {
            "redis": engine.config.use_redis,
            "checksum": engine.config.enable_checksums,
            "cluster": engine.config.use_cluster,
        },
        "cluster": cluster,
    }))
}

async fn stats(State(engine): State<Arc<NodeEngine>>) -> impl IntoResponse {
    let files_sent = engine
        .storage
        .get_counter(FILES_SENT_COUNTER)
        .await
        .unwrap_or(0);
    let users_joined = engine
        .storage
        .get_counter(USERS_JOINED_COUNTER)
        .await
        .unwrap_or(0);
    let active_sessions = engine
        .storage
        .count_connected_sessions()
        .await
        .unwrap_or(0);
    Json(json!({
        "filesSent": files_sent,
        "activeSessions": active_sessions,
        "usersJoined": users_joined,
    }))
}

// ── Cluster introspection ───────────────────────────────────────

async fn cluster_nodes(
    State(engine): State<Arc<NodeEngine>>,
) -> Result<impl IntoResponse, RelayError> {
    let nodes = engine.storage.list_nodes().await.map_err(|err| {
        warn!(%err, "node listing failed");
        RelayError::ServiceUnavailable("node store unavailable".into())
    })?;
    let nodes: Vec<_> = nodes
        .iter()
        .map(|n| {
            json!({
                "id": n.id,
                "hostname": n.hostname,
                "port": n.port,
                "status": n.status,
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "nodes": nodes })))
}

async fn cluster_master(State(engine): State<Arc<NodeEngine>>) -> impl IntoResponse {
    let master_id = engine.coordinator.current_master().await;
    let is_me = master_id.as_deref() == Some(engine.node_id());
    Json(json!({
        "success": true,
        "masterId": master_id,
        "isMe": is_me,
        "nodeId": engine.node_id(),
    }))
}

async fn cluster_stats(
    State(engine): State<Arc<NodeEngine>>,
) -> Result<impl IntoResponse, RelayError> {
    let nodes = engine.registry.active_nodes().await.map_err(|err| {
        warn!(%err, "active node listing failed");
        RelayError::ServiceUnavailable("node store unavailable".into())
    })?;
    let sessions = engine
        .storage
        .count_connected_sessions()
        .await
        .unwrap_or(0);
    let role = if engine.coordinator.is_master() {
        NodeRole::Master
    } else {
        NodeRole::Worker
    };
    Ok(Json(json!({
        "success": true,
        "stats": {
            "role": role.as_str(),
            "nodeId": engine.node_id(),
            "nodes": nodes.len(),
            "sessions": sessions,
        }
    })))
}

// ── Share admission ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateShareRequest {
    client_id: String,
    #[serde(default)]
    share_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateShareResponse {
    success: bool,
    share_id: String,
}

async fn share_create(
    State(engine): State<Arc<NodeEngine>>,
    Json(payload): Json<CreateShareRequest>,
) -> Result<impl IntoResponse, RelayError> {
    let share = engine
        .sessions
        .create_share(&payload.client_id, payload.share_id)
        .await?;
    Ok(Json(CreateShareResponse {
        success: true,
        share_id: share.share_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinShareRequest {
    share_id: String,
    client_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinShareResponse {
    success: bool,
    share_id: String,
    connected_clients: u32,
}

async fn share_join(
    State(engine): State<Arc<NodeEngine>>,
    Json(payload): Json<JoinShareRequest>,
) -> Result<impl IntoResponse, RelayError> {
    let share = engine
        .sessions
        .join_share(&payload.share_id, &payload.client_id)
        .await?;
    Ok(Json(JoinShareResponse {
        success: true,
        share_id: share.share_id,
        connected_clients: share.clients.len() as u32,
    }))
}

// ── Upload progress ─────────────────────────────────────────────

fn upload_json(state: &UploadState) -> serde_json::Value {
    json!({
        "fileId": state.file_id,
        "fileName": state.file_name,
        "fileSize": state.file_size,
        "status": state.status,
        "totalChunks": state.total_chunks,
        "uploadedChunks": state.uploaded_count(),
        "progress": state.progress_percent(),
        "pendingAcks": state.pending_acks.len(),
        "startTime": state.start_time_ms,
        "lastUpdate": state.last_update_ms,
    })
}

async fn upload_progress(
    State(engine): State<Arc<NodeEngine>>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let state = engine.transfers.upload_snapshot(&file_id).await?;
    Ok(Json(json!({ "success": true, "upload": upload_json(&state) })))
}
