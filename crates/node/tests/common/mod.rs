#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use beamdrop_node::config::Config;
use beamdrop_node::engine::NodeEngine;
use beamdrop_node::pubsub::memory::MemoryPubSub;
use beamdrop_node::pubsub::SharedPubSub;
use beamdrop_node::storage::memory::MemoryStorage;
use beamdrop_node::storage::SharedStorage;
use beamdrop_protocol::ServerEvent;
use tokio::sync::mpsc;

pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// One shared in-process fabric standing in for the cluster store.
pub fn fabric() -> (SharedStorage, SharedPubSub) {
    (
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryPubSub::new()),
    )
}

/// Short timers so retry and election behavior is observable in tests.
pub fn node_config(hostname: &str, port: u16) -> Config {
    Config {
        hostname: hostname.into(),
        port,
        use_cluster: true,
        ack_timeout: Duration::from_millis(100),
        ack_scan_interval: Duration::from_millis(40),
        election_interval: Duration::from_millis(60),
        master_lock_ttl: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(500),
        shutdown_drain: Duration::from_secs(1),
        ..Config::default()
    }
}

pub async fn build_node(
    storage: &SharedStorage,
    pubsub: &SharedPubSub,
    hostname: &str,
    port: u16,
) -> Arc<NodeEngine> {
    build_node_with(storage, pubsub, node_config(hostname, port)).await
}

pub async fn build_node_with(
    storage: &SharedStorage,
    pubsub: &SharedPubSub,
    config: Config,
) -> Arc<NodeEngine> {
    NodeEngine::bootstrap(config, storage.clone(), pubsub.clone())
        .await
        .expect("engine bootstrap failed")
}

/// Spawns only the cluster bus consumer, leaving elections and timers
/// under manual control.
pub fn spawn_subscriptions(engine: &Arc<NodeEngine>) {
    let coordinator = engine.coordinator.clone();
    let shutdown = engine.shutdown_signal();
    tokio::spawn(async move {
        let _ = coordinator.run_subscriptions(shutdown).await;
    });
}

/// Lets freshly spawned subscription loops attach before traffic flows.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// A connected client as the gateway would wire it: a bound socket
/// channel plus a registered session.
pub struct TestClient {
    pub client_id: String,
    pub socket_id: String,
    pub engine: Arc<NodeEngine>,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

pub async fn connect(engine: &Arc<NodeEngine>, client_id: &str) -> TestClient {
    let socket_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    engine.sockets.bind_socket(&socket_id, tx).await;
    let registered = engine
        .sessions
        .register(client_id, &socket_id)
        .await
        .expect("registration failed");
    assert!(matches!(registered, ServerEvent::Registered { .. }));
    engine.sockets.bind_client(client_id, &socket_id).await;
    TestClient {
        client_id: client_id.to_string(),
        socket_id,
        engine: engine.clone(),
        rx,
    }
}

impl TestClient {
    /// Next event matching the predicate; unrelated events are skipped.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + EVENT_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = tokio::time::timeout(remaining, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for event ({})", self.client_id))
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Asserts nothing matching arrives within the window.
    pub async fn assert_silent_for<F>(&mut self, window: Duration, mut pred: F)
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(event)) => {
                    assert!(!pred(&event), "unexpected event arrived: {event:?}");
                }
                Ok(None) => return,
                Err(_) => return,
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.engine.sockets.unbind_socket(&self.socket_id).await;
        self.engine
            .sessions
            .disconnect(&self.client_id, &self.socket_id)
            .await;
    }

    /// What a real receiver does on `chunk-received`.
    pub async fn ack_chunk(&self, file_id: &str, chunk_index: u32) {
        self.engine
            .transfers
            .chunk_acknowledged(&self.client_id, file_id, chunk_index)
            .await;
    }
}
