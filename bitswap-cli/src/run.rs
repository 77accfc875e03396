use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bitswap_core::{Bitswap, GetOptions, MemoryBlockStore, MemoryNetwork, Network};
use clap::{Parser, Subcommand};
use cid::Cid;
use libp2p::PeerId;
use multihash::{Code, MultihashDigest};
use tracing::info;

use crate::config::{CliConfig, CONFIG_FILE_NAME, ENV_PREFIX};

#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    #[clap(long)]
    cfg: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

impl Cli {
    fn make_overrides_map(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    #[clap(about = "Put raw bytes into the in-memory store and announce them, printing the CID.")]
    Put { data: String },
    #[clap(about = "Get a block by CID, waiting up to the configured timeout.")]
    Get { cid: String },
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    let cfg_path = bitswap_util::config_path("bitswap", CONFIG_FILE_NAME).ok();
    let sources = vec![cfg_path, cli.cfg.clone()];
    let config: CliConfig =
        bitswap_util::make_config(&CliConfig::default(), &sources, ENV_PREFIX, cli.make_overrides_map())
            .context("failed to build configuration")?;

    let metrics = bitswap_metrics::install();
    metrics.register(bitswap_metrics::BitswapMetrics::default());

    // A single in-process node with no peers is enough to demonstrate the
    // put/get surface; a real deployment would dial out over a real
    // `Network` implementation instead of `MemoryNetwork`.
    let network = MemoryNetwork::new();
    let self_id = PeerId::random();
    let net: Arc<dyn Network> = Arc::new(network.handle(self_id).await);
    let store = Arc::new(MemoryBlockStore::default());
    let bitswap = Bitswap::new(net, store, config.core);
    bitswap.run().await;

    run_cli_command(&bitswap, &config, cli).await?;

    bitswap.stop().await;
    Ok(())
}

async fn run_cli_command(bitswap: &Arc<Bitswap>, config: &CliConfig, cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Put { data } => {
            let hash = Code::Sha2_256.digest(data.as_bytes());
            let cid = Cid::new_v1(bitswap_core::RAW_CODEC, hash);
            let stored = bitswap.put(cid, data.into_bytes()).await;
            info!(cid = %cid, stored, "put complete");
            println!("{cid}");
        }
        Commands::Get { cid } => {
            let cid: Cid = cid.parse().context("invalid CID")?;
            let opts = GetOptions {
                timeout: config.get_timeout(),
                ..GetOptions::default()
            };
            match bitswap.get(cid, opts, None).await {
                Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
                None => anyhow::bail!("timed out waiting for {cid}"),
            }
        }
    }
    Ok(())
}
