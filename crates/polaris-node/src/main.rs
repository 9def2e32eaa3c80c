//! Polaris node entry point

use clap::Parser;
use polaris_network::LoopbackNetwork;
use polaris_node::cli::Cli;
use polaris_node::config::NodeConfig;
use polaris_node::node::Node;
use polaris_primitives::H256;
use polaris_snapshot::RollbackTarget;
use tracing_subscriber::EnvFilter;

fn parse_rollback_target(raw: &str) -> anyhow::Result<RollbackTarget> {
    if raw == "highest" {
        return Ok(RollbackTarget::Highest);
    }
    let (height, hash) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("rollback target must be 'highest' or '<height>:<hash>'"))?;
    Ok(RollbackTarget::At {
        height: height.parse()?,
        hash: H256::from_hex(hash)?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.clone())),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.datadir = cli.datadir.clone();

    let network = LoopbackNetwork::new();
    let node = Node::new(config, &network)?;

    if let Some(raw) = &cli.rollback {
        let target = parse_rollback_target(raw)?;
        node.run_rollback(target).await?;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    node.run(shutdown_rx).await;
    Ok(())
}
