use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use beamdrop_protocol::Channel;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::pubsub::{PubSub, Subscription};

/// In-process bus. One instance shared by every engine in the process
/// stands in for the cluster store's pub/sub, with identical ordering:
/// each subscriber has its own queue fed in publication order.
#[derive(Default)]
pub struct MemoryPubSub {
    subscribers: Mutex<HashMap<&'static str, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: Channel, payload: String) -> Result<()> {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(channel.as_str()) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .entry(channel.as_str())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
