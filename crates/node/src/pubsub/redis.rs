use anyhow::{Context, Result};
use async_trait::async_trait;
use beamdrop_protocol::Channel;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pubsub::{PubSub, Subscription};

/// Redis pub/sub bridge. Publishing shares one multiplexed connection;
/// each subscription owns a dedicated connection whose message stream is
/// pumped into the subscriber's queue by a background task, preserving
/// publication order.
pub struct RedisPubSub {
    client: redis::Client,
    publish_conn: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis connection url")?;
        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect redis publisher")?;
        Ok(Self {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: Channel, payload: String) -> Result<()> {
        let mut conn = self.publish_conn.clone();
        let _: () = conn.publish(channel.as_str(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open redis pub/sub connection")?;
        pubsub
            .subscribe(channel.as_str())
            .await
            .with_context(|| format!("failed to subscribe to {}", channel.as_str()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel = channel.as_str(), %err, "undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    debug!(channel = channel.as_str(), "subscriber gone, ending pump");
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
