//! ledger-node: consensus node of a permissioned distributed ledger
//!
//! Votes on submitted items together with the configured peers, keeps the
//! resulting item states in a local SQLite ledger and recovers missed
//! decisions by resyncing with the network.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use ledger_node::config::Config;
use ledger_node::item::{BasicCheck, ItemId};
use ledger_node::ledger::Ledger;
use ledger_node::network::{NodeId, UdpChannel};
use ledger_node::node::{Node, NodeParts};
use ledger_node::signing::{load_or_generate_key, parse_signing_key, Ed25519Signer};
use ledger_node::SettingsHandle;

#[derive(Parser)]
#[command(name = "ledger-node")]
#[command(about = "Consensus node of a permissioned distributed ledger")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ledger-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long, env = "LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node ID (overrides config file)
    #[arg(long, env = "LEDGER_NODE_ID")]
    node_id: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print this node's public key, generating the key if needed
    Keygen,
    /// Print the ledger's record of an item as JSON
    State {
        /// Hex item id
        item_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ledger_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).context("failed to load configuration")?;
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }

    match cli.command {
        Some(Command::Keygen) => {
            let key = signing_key(&config)?;
            println!("{}", hex::encode(key.verifying_key().to_bytes()));
            return Ok(());
        }
        Some(Command::State { item_id }) => {
            let item_id: ItemId = item_id.parse().context("invalid item id")?;
            let ledger = Ledger::open(&config.ledger_path(), config.ledger_options())?;
            let result = ledger
                .item_result(&item_id)?
                .with_testnet(config.node.is_testnet);
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        None => {}
    }

    config.validate().context("invalid configuration")?;

    let node_id = config.node_id();
    let settings = config.consensus_settings();
    info!(
        node = %node_id,
        data_dir = %config.node.data_dir.display(),
        total = settings.quorum.total_nodes,
        positive = settings.quorum.positive,
        negative = settings.quorum.negative,
        resync_break = settings.quorum.resync_break,
        "Starting ledger-node"
    );

    let ledger = Arc::new(
        Ledger::open(&config.ledger_path(), config.ledger_options()).context("failed to open ledger")?,
    );
    let signer = Arc::new(Ed25519Signer::new(node_id, signing_key(&config)?, config.peer_keys()?));

    let (channel, inbound) = UdpChannel::bind(node_id, config.listen_addr()?, config.transport_settings())
        .await
        .context("failed to bind UDP channel")?;
    for peer in &config.peers {
        channel.add_peer(NodeId(peer.id), peer.socket_addr()?);
    }

    let node = Node::start(NodeParts {
        node_id,
        ledger,
        channel,
        inbound,
        signer,
        checker: Arc::new(BasicCheck),
        settings: SettingsHandle::new(settings),
        is_testnet: config.node.is_testnet,
        max_processors: config.node.max_processors,
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.shutdown();

    Ok(())
}

fn signing_key(config: &Config) -> anyhow::Result<ed25519_dalek::SigningKey> {
    match &config.node.secret_key {
        Some(secret) => Ok(parse_signing_key(secret)?),
        None => Ok(load_or_generate_key(&config.node.data_dir)?),
    }
}
