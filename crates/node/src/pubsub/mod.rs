pub mod memory;
pub mod redis;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use beamdrop_protocol::{Channel, PAYLOAD_WARN_BYTES};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Ordered stream of payloads for one subscriber of one channel. Messages
/// arrive in publication order; dropping the subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Channel-named broadcast with at-least-once local delivery and
/// per-subscriber ordering.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: Channel, payload: String) -> Result<()>;
    async fn subscribe(&self, channel: Channel) -> Result<Subscription>;
}

pub type SharedPubSub = Arc<dyn PubSub>;

/// Serialize a payload for the bus, warning when it crosses the
/// operational size threshold.
pub fn encode_payload<T: Serialize>(channel: Channel, payload: &T) -> Result<String> {
    let json = serde_json::to_string(payload)?;
    if json.len() > PAYLOAD_WARN_BYTES {
        warn!(
            channel = channel.as_str(),
            bytes = json.len(),
            "pub/sub payload exceeds {} KiB",
            PAYLOAD_WARN_BYTES / 1024
        );
    }
    Ok(json)
}

pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    Ok(serde_json::from_str(payload)?)
}
