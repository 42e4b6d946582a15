use std::error::Error;
use std::path::PathBuf;

use clap::Parser;

use synapse_relay::config::{Cli, NodeConfig};
use synapse_relay::logging;
use synapse_relay::node::RelayNode;
use synapse_relay::rlog;
use synapse_relay::storage::Store;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    logging::init();
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_ref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let db_path = cli.db.unwrap_or_else(|| PathBuf::from("synapse-relay.db"));
    let store = Store::open(&db_path)?;
    rlog!(
        "starting with {} peer(s), db {}",
        config.peer_ports.len(),
        db_path.display()
    );

    let node = RelayNode::start(config, store).await?;

    tokio::signal::ctrl_c().await?;
    rlog!("ctrl-c received, shutting down");
    node.shutdown().await;
    Ok(())
}
