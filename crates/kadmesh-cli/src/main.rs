//! kadmesh CLI
//!
//! Run a DHT node, or join the network briefly to put, get or remove a
//! value.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use kadmesh_dht::{Dht, DhtOptions, FileStorageAdapter, KeyBlock, NodeId, ReplicationControl};
use kadmesh_transport::MuxRegistry;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::Config;

/// kadmesh - Kademlia DHT node
#[derive(Parser)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the UDP bind address
    #[arg(short, long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run,

    /// Store a value
    Put {
        /// Key
        key: String,

        /// Value
        value: String,

        /// Lifetime in hours (0 for the maximum)
        #[arg(long, default_value_t = 8)]
        hours: u8,

        /// Acknowledgements required
        #[arg(long, default_value_t = 1)]
        quorum: u8,

        /// Send at high priority
        #[arg(long)]
        high_priority: bool,
    },

    /// Look up values
    Get {
        /// Key
        key: String,

        /// Maximum number of values (0 for all)
        #[arg(long, default_value_t = 0)]
        max: u16,

        /// Query every close node instead of stopping early
        #[arg(long)]
        exhaustive: bool,
    },

    /// Withdraw this node's value under a key
    Remove {
        /// Key
        key: String,
    },

    /// Join the network and write the routing state to a file
    Export {
        /// Output file
        output: PathBuf,

        /// Maximum contacts (0 for the configured limit)
        #[arg(long, default_value_t = 0)]
        max: usize,
    },

    /// Show the effective configuration
    Status,

    /// Generate a key-block authority keypair
    Keygen {
        /// Output file for the private key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sign and publish a key-block
    Block {
        /// Key to block
        key: String,

        /// Authority private key file
        #[arg(long)]
        authority: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    if let Some(bind) = &cli.bind {
        config.dht.bind_addr = bind.parse().context("invalid bind address")?;
    }
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Run => run(&config).await?,
        Commands::Put {
            key,
            value,
            hours,
            quorum,
            high_priority,
        } => {
            let dht = join(&config).await?;
            let result = dht
                .put(
                    key.as_bytes(),
                    value.into_bytes(),
                    0,
                    hours,
                    ReplicationControl::new(quorum, 0),
                    high_priority,
                )
                .await;
            dht.destroy().await;
            let result = result?;
            println!("Stored at {} of {} required nodes", result.acks, result.required);
            if let Some(div) = result.diversification {
                println!("Key is diversified ({:?}) over {} keys", div.kind, div.put_keys.len());
            }
        }
        Commands::Get {
            key,
            max,
            exhaustive,
        } => {
            let dht = join(&config).await?;
            let result = dht.get(key.as_bytes(), max, exhaustive).await;
            dht.destroy().await;
            let result = result?;
            if result.values.is_empty() {
                println!("No values found");
            }
            for value in &result.values {
                println!(
                    "{}  from {}",
                    String::from_utf8_lossy(&value.payload),
                    value.originator
                );
            }
        }
        Commands::Remove { key } => {
            // A fresh process holds no value of its own, so publish the
            // empty value holders treat as a withdrawal
            let dht = join(&config).await?;
            let result = dht
                .put(key.as_bytes(), Vec::new(), 0, 1, ReplicationControl::DEFAULT, true)
                .await;
            dht.destroy().await;
            println!("Withdrawal stored at {} nodes", result?.acks);
        }
        Commands::Export { output, max } => {
            let dht = join(&config).await?;
            let written = export(&dht, &output, max);
            dht.destroy().await;
            println!("Wrote {} contacts to {}", written?, output.display());
        }
        Commands::Status => show_status(&config),
        Commands::Keygen { output } => generate_keypair(output)?,
        Commands::Block { key, authority } => publish_block(&config, &key, &authority).await?,
    }

    Ok(())
}

/// Create a node, seed it from the saved state if any and join
async fn join(config: &Config) -> anyhow::Result<Arc<Dht>> {
    let storage = FileStorageAdapter::open(&config.node.storage_dir, config.dht.diversification.clone())
        .with_context(|| format!("opening storage {}", config.node.storage_dir.display()))?;
    let mut options = DhtOptions::new(config.dht.clone()).with_storage(Arc::new(storage));
    if let Some(id) = config.node_id()? {
        options = options.with_node_id(id);
    }
    let dht = Dht::create(Arc::new(MuxRegistry::new()), options).await?;

    let state_file = &config.node.state_file;
    if state_file.exists() {
        match File::open(state_file).map(BufReader::new) {
            Ok(mut reader) => match dht.import_state(&mut reader) {
                Ok(count) => {
                    tracing::info!("Imported {} contacts from {}", count, state_file.display());
                    dht.bootstrap(&[]).await?;
                }
                Err(e) => tracing::warn!("Ignoring state file {}: {}", state_file.display(), e),
            },
            Err(e) => tracing::warn!("Cannot open {}: {}", state_file.display(), e),
        }
    }
    Ok(dht)
}

fn export(dht: &Dht, path: &Path, max: usize) -> anyhow::Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    Ok(dht.export_state(&mut writer, max)?)
}

/// Run until Ctrl+C, reporting status periodically
async fn run(config: &Config) -> anyhow::Result<()> {
    let dht = join(config).await?;
    println!("kadmesh node {}", dht.local_contact());
    println!("Press Ctrl+C to stop");

    let period = Duration::from_secs(config.node.status_interval_secs);
    let mut status = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = status.tick() => {
                dht.print();
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    match export(&dht, &config.node.state_file, 0) {
        Ok(count) => tracing::info!("Saved {} contacts", count),
        Err(e) => tracing::warn!("Could not save routing state: {}", e),
    }
    dht.destroy().await;
    Ok(())
}

fn show_status(config: &Config) {
    println!("kadmesh {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Node:");
    println!("  Id: {}", config.node.id.as_deref().unwrap_or("random"));
    println!("  State file: {}", config.node.state_file.display());
    println!("  Storage: {}", config.node.storage_dir.display());
    println!();
    println!("DHT:");
    println!("  Network: {}", config.dht.network);
    println!("  Bind: {}", config.dht.bind_addr);
    if let Some(external) = config.dht.external_addr {
        println!("  External: {}", external);
    }
    println!("  Bootstrap nodes: {}", config.dht.bootstrap.len());
    println!("  K={} alpha={}", config.dht.k, config.dht.alpha);
    println!(
        "  Key-block authority: {}",
        config.dht.key_block_authority.as_deref().unwrap_or("none")
    );
}

fn generate_keypair(output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Generating key-block authority keypair...");
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    println!(
        "Public key (key_block_authority): {}",
        hex::encode(signing_key.verifying_key().to_bytes())
    );

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, hex::encode(signing_key.to_bytes()))?;
            println!("Private key saved to: {}", path.display());
        }
        None => println!("Private key not saved (use --output to save)"),
    }
    Ok(())
}

async fn publish_block(config: &Config, key: &str, authority: &Path) -> anyhow::Result<()> {
    let encoded = std::fs::read_to_string(authority)
        .with_context(|| format!("reading {}", authority.display()))?;
    let bytes: [u8; 32] = hex::decode(encoded.trim())?
        .try_into()
        .map_err(|_| anyhow::anyhow!("authority key must be 32 bytes"))?;
    let signing_key = SigningKey::from_bytes(&bytes);
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    let block = KeyBlock::sign(NodeId::hash(key.as_bytes()), created, &signing_key);

    let dht = join(config).await?;
    let accepted = dht.publish_key_block(block).await;
    dht.destroy().await;
    println!("Key-block accepted by {} nodes", accepted?);
    Ok(())
}
