use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cx_chain::chain::Blockchain;
use cx_chain::config::NodeConfig;
use cx_chain::consensus::Engine;
use cx_chain::crypto::{load_or_generate_keypair, save_keypair, Keypair};
use cx_chain::miner::{Miner, Worker};
use cx_chain::p2p::Node;
use cx_chain::storage::Storage;

#[derive(Parser)]
#[command(author, version, about = "Permissioned proof-of-authority blockchain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a new secp256k1 keypair for the node
    Keygen {
        #[arg(short, long, default_value = "keys/node.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };
    config.ensure_directories()?;

    let keypair = load_or_generate_keypair(&config.key_path)?;
    let address = keypair.address();
    info!(address = %address, "node identity loaded");

    let mut validators = config.validator_addresses()?;
    if validators.is_empty() {
        validators.push(address);
    }

    let engine = Arc::new(Engine::new(
        config.chain.epoch,
        config.chain.difficulty,
        config.chain.delay,
        config.chain.chain_id,
        validators,
    ));
    engine.select_validator();

    let storage = Storage::open(&config.data_dir.join("db"))?;
    let chain = Blockchain::new(storage, engine.clone(), &config, address, None)?;
    chain.start();

    let worker = Worker::new(
        Miner::new(keypair.clone()),
        engine.clone(),
        chain.clone(),
        config.chain.delay,
    );
    worker.run();

    let node = Node::new(keypair, config.p2p_listen, chain.clone());
    node.start(&config.bootstrap).await?;

    signal::ctrl_c().await?;
    info!("shutting down node");

    worker.stop().await;
    node.stop().await;
    chain.stop().await;

    info!("node terminated");
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let keypair = Keypair::generate();
    save_keypair(&path, &keypair)?;
    info!(?path, "generated node keypair");
    Ok(())
}
