use std::sync::Arc;

use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use orbitsphere_relay::{
    Broker, Config, EventRouter, FileCheckpointStore, RpcChain, Watcher,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHECKPOINT_PATH: &str = "orbitsphere-relay.checkpoint.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    info!(contract = %config.contract_address, "Starting OrbitSphere relay");

    let broker = Arc::new(Broker::new(&config.broker_url));
    broker.ensure_ready().await?;

    let provider = ProviderBuilder::new().connect_ws(WsConnect::new(&config.rpc_url)).await?;
    let chain = RpcChain::new(provider.root().to_owned(), config.contract_address);

    let watcher = Watcher::new(
        chain,
        EventRouter::new(Arc::clone(&broker)),
        FileCheckpointStore::new(CHECKPOINT_PATH),
    );
    let handle = watcher.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown().await?;
    broker.shutdown().await?;
    Ok(())
}
