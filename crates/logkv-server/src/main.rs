//! # main
//!
//! why: boot one logkv node from the command line
//! relations: parses arguments into a ServerConfig and hands off to server.rs
//! what: argument parsing, tracing setup, exit codes (0 clean, 1 usage, 2 fatal io)

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use logkv_core::ConsensusConfig;
use logkv_server::{RoleHint, Server, ServerConfig};

/// Command-line arguments for one logkv node.
#[derive(Parser, Debug)]
#[command(
    name = "logkv-server",
    about = "run one node of the logkv replicated key-value store"
)]
struct Args {
    /// tcp port to listen on
    port: u16,

    /// startup role hint; a leader hint campaigns immediately
    #[arg(value_enum)]
    role: RoleHint,

    /// unique small integer id for this node within the cluster
    id: u64,

    /// peer addresses as host:port, excluding this node
    peers: Vec<String>,

    /// directory for the wal, its metadata and snapshots
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() {
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };
    for peer in &args.peers {
        if !peer.contains(':') {
            eprintln!("invalid peer address {peer:?}, expected host:port");
            process::exit(1);
        }
    }

    let server = match start_node(args) {
        Ok(server) => server,
        Err(err) => {
            error!("startup failed: {err:#}");
            process::exit(2);
        }
    };
    server.join();
}

fn start_node(args: Args) -> anyhow::Result<Server> {
    let data_dir = args.data_dir.clone();
    Server::start(ServerConfig {
        port: args.port,
        role: args.role,
        id: args.id,
        peers: args.peers,
        data_dir: args.data_dir,
        tuning: ConsensusConfig::default(),
    })
    .with_context(|| format!("failed to bring the node up in {}", data_dir.display()))
}
