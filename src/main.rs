use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use meshlink_gateway::bridge::split_frames;
use meshlink_gateway::db::{self, SqliteStore, restore_json};
use meshlink_gateway::nodes::NodeRecord;
use meshlink_gateway::provisioning::NODES_STATE_KEY;
use meshlink_gateway::router::{GATEWAY_STATE_KEY, GatewayState};
use meshlink_gateway::{Config, Daemon};

/// Meshlink - provisioning and command routing for a BLE mesh fleet
#[derive(Parser)]
#[command(name = "meshlink", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/meshlink/config.toml)
    #[arg(short, long, env = "MESHLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the state database
    #[arg(long, env = "MESHLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway: commands on stdin, notifications on stdout
    Gateway,
    /// Run the provisioner against the simulated fleet
    Provisioner,
    /// Show the side-channel frames for a message
    Chunk {
        /// Message text
        text: String,
        /// Frame limit in bytes (defaults to the configured limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print saved node registry and gateway state
    Nodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,meshlink_gateway=info",
        1 => "info,meshlink_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    // stdout carries notifier output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Gateway => Daemon::new(config)?.run_gateway().await?,
        Command::Provisioner => Daemon::new(config)?.run_provisioner().await?,
        Command::Chunk { text, limit } => {
            let limit = limit.unwrap_or(config.bridge.frame_limit).max(2);
            for frame in split_frames(text.as_bytes(), limit) {
                println!("{:>3} {}", frame.len(), String::from_utf8_lossy(&frame));
            }
        }
        Command::Nodes => show_nodes(&config)?,
    }
    Ok(())
}

fn show_nodes(config: &Config) -> anyhow::Result<()> {
    let path = config.db_path();
    if !path.exists() {
        println!("No saved state at {}", path.display());
        return Ok(());
    }

    let store = SqliteStore::new(db::init(&path)?);
    let nodes: Vec<NodeRecord> = restore_json(&store, NODES_STATE_KEY)?.unwrap_or_default();
    let gateway: Option<GatewayState> = restore_json(&store, GATEWAY_STATE_KEY)?;

    if nodes.is_empty() {
        println!("No enrolled nodes");
    }
    for node in &nodes {
        let caps: Vec<&str> = node.capabilities().iter().map(|c| c.name()).collect();
        println!(
            "{:<8} {}  {:?}{}  group {:?}  [{}]",
            node.display_name,
            node.address,
            node.phase,
            if node.is_degraded() { " (degraded)" } else { "" },
            node.group_state(),
            caps.join(", ")
        );
    }
    if let Some(gateway) = gateway {
        println!("{}", serde_json::to_string_pretty(&gateway)?);
    }
    Ok(())
}
