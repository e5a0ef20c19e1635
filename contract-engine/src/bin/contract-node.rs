//! contract-node - Runs the confirmation monitor against an Esplora endpoint

use anyhow::Context;
use clap::Parser;
use contract_engine::{
    chain::ChainNetwork,
    config::{init_logging, NodeConfig},
    node::ContractNode,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "contract-node", version, about = "Bitcoin escrow contract node")]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured network
    #[arg(long, value_parser = parse_network)]
    network: Option<ChainNetwork>,

    /// Override the Esplora base URL
    #[arg(long)]
    esplora_url: Option<String>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_network(value: &str) -> Result<ChainNetwork, String> {
    match value {
        "mainnet" => Ok(ChainNetwork::Mainnet),
        "testnet" => Ok(ChainNetwork::Testnet),
        "regtest" => Ok(ChainNetwork::Regtest),
        other => Err(format!("unknown network: {}", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(network) = args.network {
        config.chain.network = network;
    }
    if let Some(url) = args.esplora_url {
        config.chain.esplora_url = Some(url);
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level);
    info!("Starting contract node on {:?}", config.chain.network);

    let node = ContractNode::from_config(config)
        .await
        .context("Failed to initialize contract node")?;

    let health = node.health_check().await?;
    if health.healthy {
        info!("Chain tip at {:?}", health.tip_height);
    } else {
        error!("Node started with issues: {}", health.issues.join("; "));
    }

    node.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    node.shutdown().await?;
    Ok(())
}
