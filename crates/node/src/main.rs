use std::sync::Arc;

use anyhow::Context;
use beamdrop_node::config::Config;
use beamdrop_node::engine::NodeEngine;
use beamdrop_node::gateway;
use beamdrop_node::pubsub::memory::MemoryPubSub;
use beamdrop_node::pubsub::redis::RedisPubSub;
use beamdrop_node::pubsub::SharedPubSub;
use beamdrop_node::storage::memory::MemoryStorage;
use beamdrop_node::storage::redis::RedisStorage;
use beamdrop_node::storage::SharedStorage;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beamdrop-node", version, about = "beamdrop file-sharing relay node")]
struct Args {
    /// Listen port; overrides PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Advertised hostname; overrides NODE_HOSTNAME.
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(hostname) = args.hostname {
        config.hostname = hostname;
    }

    let (storage, pubsub): (SharedStorage, SharedPubSub) = if config.use_redis {
        info!(host = %config.redis.host, port = config.redis.port, "using redis backend");
        let storage = RedisStorage::connect(&config.redis)
            .await
            .context("redis storage connection failed")?;
        let pubsub = RedisPubSub::connect(&config.redis.url())
            .await
            .context("redis pub/sub connection failed")?;
        (Arc::new(storage), Arc::new(pubsub))
    } else {
        if config.use_cluster {
            warn!("USE_CLUSTER without USE_REDIS only coordinates within this process");
        }
        info!("using embedded in-memory backend");
        (Arc::new(MemoryStorage::new()), Arc::new(MemoryPubSub::new()))
    };

    let engine = NodeEngine::bootstrap(config, storage, pubsub).await?;
    engine.start().await;

    let addr = format!("0.0.0.0:{}", engine.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, node_id = %engine.node_id(), "relay node listening");

    let app = gateway::router(engine.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining");
        })
        .await
        .context("server error")?;

    engine.shutdown().await;
    Ok(())
}
