//! CLI entry point for the mesh messenger.
//!
//! This binary manages the device identity and configuration and runs a
//! node over UDP on the local wireless network, with a small interactive
//! prompt on stdin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use mesh_messenger::{
    crypto::{DeviceIdentity, IdentityKeyStore},
    messaging::{PeerId, Profile},
    storage::{DiskMediaStore, MemoryStore},
    transport::UdpTransport,
    utils::{Clock, MeshConfig, StorageConfig, SystemClock, DEFAULT_CONFIG_FILE},
    MeshNode,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

const IDENTITY_FILE: &str = "identity.json";
const KEY_FILE: &str = "keys.json";

/// Mesh Messenger - end-to-end encrypted messaging over a local wireless mesh
#[derive(Parser)]
#[command(name = "mesh-node")]
#[command(about = "Serverless messaging node for local peer-to-peer groups")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for identity, keys and media
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the device identity
    Identity {
        #[command(subcommand)]
        action: IdentityCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Run a node on the local network
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Act as the group owner
        #[arg(short, long)]
        group_owner: bool,
        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Print the peer id, creating one on first use
    Show,
    /// Print the fingerprint of the key agreement key
    Fingerprint,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet)?;

    let mut config = MeshConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage = StorageConfig::rooted_at(data_dir);
    }

    match cli.command {
        Commands::Identity { action } => handle_identity_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Run {
            port,
            group_owner,
            name,
        } => handle_run_command(port, group_owner, name, config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

fn load_identity(config: &MeshConfig) -> Result<(DeviceIdentity, Arc<IdentityKeyStore>)> {
    config.ensure_directories()?;
    let keys_dir: &Path = &config.storage.keys_dir;

    let identity = DeviceIdentity::load_or_create(keys_dir.join(IDENTITY_FILE))
        .context("loading device identity")?;
    let keys = Arc::new(IdentityKeyStore::open(keys_dir.join(KEY_FILE)));
    Ok((identity, keys))
}

fn handle_identity_commands(action: IdentityCommands, config: &MeshConfig) -> Result<()> {
    let (identity, keys) = load_identity(config)?;
    match action {
        IdentityCommands::Show => {
            println!("Peer ID:    {}", identity.peer_id);
            println!("Created at: {}", identity.created_at.to_rfc3339());
        }
        IdentityCommands::Fingerprint => {
            println!("{}", keys.own_fingerprint()?);
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MeshConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MeshConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                MeshConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

async fn handle_run_command(
    port: Option<u16>,
    group_owner: bool,
    name: Option<String>,
    mut config: MeshConfig,
) -> Result<()> {
    if let Some(port) = port {
        config.network.listen_port = port;
    }
    if group_owner {
        config.network.is_group_owner = true;
    }
    config.validate()?;

    let (identity, keys) = load_identity(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let profile = Profile {
        peer_id: identity.peer_id,
        updated_at: clock.now_millis(),
        username: name.unwrap_or_else(|| format!("mesh-{}", identity.peer_id)),
        image_ref: None,
    };

    info!("Starting mesh node {}", identity.peer_id);
    info!("Port: {}", config.network.listen_port);
    info!("Group owner: {}", config.network.is_group_owner);

    let transport = Arc::new(UdpTransport::bind(&config.network).await?);
    let media = Arc::new(DiskMediaStore::new(config.storage.media_dir.clone()));
    let node = MeshNode::new(
        config,
        identity,
        keys,
        profile,
        transport,
        Arc::new(MemoryStore::new()),
        media,
        clock,
    );
    node.start();

    println!("Node {} running. Type 'help' for commands.", node.peer_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_prompt_line(&node, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        // stdin closed; keep serving until Ctrl-C
                        if let Err(e) = signal::ctrl_c().await {
                            error!("Failed to listen for shutdown signal: {}", e);
                        }
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down gracefully...");
    node.shutdown();
    Ok(())
}

/// Run one prompt command. Returns `false` when the user asked to quit.
async fn handle_prompt_line(node: &MeshNode, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();
    let rest = parts.next();

    let peer = |arg: Option<&str>| -> Option<PeerId> { arg.and_then(|a| a.parse().ok()) };

    let result = match (command, peer(arg)) {
        ("", _) => Ok(()),
        ("help", _) => {
            println!("peers | send <id> <text> | handshake <id> | sessions | verify <id> | quit");
            Ok(())
        }
        ("quit" | "exit", _) => return false,
        ("peers", _) => {
            for record in node.online_peers() {
                println!(
                    "{}  {}",
                    record.peer_id,
                    record.address.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        ("sessions", _) => {
            for peer_id in node.sessions().active_sessions() {
                if let Some(info) = node.sessions().session_info(peer_id) {
                    println!(
                        "{}  {}{}",
                        info.peer_id,
                        info.peer_fingerprint,
                        if info.verified { "  verified" } else { "" }
                    );
                }
            }
            Ok(())
        }
        ("send", Some(peer_id)) => match node.send_text(peer_id, rest.unwrap_or_default()).await {
            Ok(Some(message)) => {
                println!("sent #{}", message.id);
                Ok(())
            }
            Ok(None) => {
                println!("{peer_id} is not reachable");
                Ok(())
            }
            Err(e) => Err(e),
        },
        ("handshake", Some(peer_id)) => node.initiate_handshake(peer_id).await.map(|sent| {
            if !sent {
                println!("{peer_id} is not reachable");
            }
        }),
        ("verify", Some(peer_id)) => {
            if !node.sessions().mark_verified(peer_id) {
                println!("no session with {peer_id}");
            }
            Ok(())
        }
        (other, _) => {
            println!("unknown command or missing peer id: {other}");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("{}", e);
    }
    true
}
