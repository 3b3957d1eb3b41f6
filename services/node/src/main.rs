use anyhow::Result;
use fedquorum_node::config::NodeConfig;
use fedquorum_support::{init_tracing, shutdown_tracer, start_health_server, start_metrics_server};
use fedquorum_transport::NatsTransport;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env()?;
    init_tracing("fedquorum-node")?;
    start_health_server(config.health_port).await?;
    start_metrics_server(config.metrics_port).await?;

    info!(node = %config.node_id, peers = ?config.known_peers, endpoint = %config.transport_endpoint, "starting federation node");

    let peer_count = config.known_peers.len().saturating_sub(1);
    let transport = NatsTransport::connect(&config.transport_endpoint, config.node_id.clone(), peer_count).await?;
    let final_count = fedquorum_node::run(config, transport).await?;

    info!(current_count = final_count, "node shut down cleanly");
    shutdown_tracer();
    Ok(())
}
