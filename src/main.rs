use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod config;
mod error;
mod listen;
mod logging;
mod manager;
mod monitor;
mod node_id;
mod p2p;
mod publish;
mod radar;
mod wire;

use config::{RadarConfig, RetryPolicy};
use p2p::BitcoinNetwork;
use radar::Radar;

#[derive(Parser, Debug)]
#[command(name = "txradar", version, about = "Relay Bitcoin transaction announcements to subscribers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the network and publish observed transactions
    Run(RunArgs),
    /// Print what a running radar publishes
    Listen(ListenArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// optional TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// mirror log output to stdout
    #[arg(long)]
    display_output: bool,

    /// tokio worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// number of outbound connections to maintain
    #[arg(long)]
    hosts: Option<usize>,

    /// chain: mainnet/testnet/testnet4/signet/regtest
    #[arg(long)]
    chain: Option<String>,

    /// peers to connect to before falling back to DNS seeds (can be repeated)
    #[arg(long)]
    peer: Vec<SocketAddr>,

    /// directory for debug.log and error.log
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// accept subscribers from this machine only
    #[arg(long)]
    local_only: Option<bool>,

    /// retry failed connects immediately instead of backing off
    #[arg(long)]
    no_backoff: bool,
}

impl RunArgs {
    fn into_config(self) -> Result<RadarConfig> {
        let mut config = RadarConfig::load(self.config.as_deref())?;
        config.display_output |= self.display_output;
        if let Some(threads) = self.threads {
            config.thread_count = threads;
        }
        if let Some(hosts) = self.hosts {
            config.target_connection_count = hosts;
        }
        if let Some(chain) = self.chain {
            config.network = config::parse_network(&chain)?;
        }
        if !self.peer.is_empty() {
            config.peers = self.peer;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = dir;
        }
        if let Some(local_only) = self.local_only {
            config.local_only = local_only;
        }
        if self.no_backoff {
            config.retry = RetryPolicy::immediate();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// transaction channel
    #[arg(long, default_value = "127.0.0.1:7678")]
    notify: SocketAddr,

    /// connection count channel
    #[arg(long)]
    count: Option<SocketAddr>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args.into_config()?),
        Commands::Listen(args) => {
            tracing_subscriber::fmt().with_writer(std::io::stderr).init();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build runtime")?;
            runtime.block_on(listen::run(args.notify, args.count))
        }
    }
}

fn run(config: RadarConfig) -> Result<()> {
    let _log_guards = logging::init(&config.log_dir, config.display_output)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async {
        let network = Arc::new(BitcoinNetwork::new(&config));
        let radar = Radar::start(&config, network).await?;
        info!(
            notify = %radar.notify_addr(),
            count = %radar.count_addr(),
            "accepting subscribers"
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!(active = radar.active_connections(), "shutdown requested");
        radar.shutdown().await?;
        Ok::<_, anyhow::Error>(())
    })?;

    runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(())
}
