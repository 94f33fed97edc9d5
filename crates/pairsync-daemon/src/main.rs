//! pairsync: Symmetric two-peer file sync over TCP.
//!
//! Run the same binary on both machines, each pointed at the other. The
//! first to find its peer listening becomes the client; the other serves.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pairsync_core::Recorder;
use pairsync_daemon::{Daemon, PeerLink, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "pairsync")]
#[command(about = "Two-peer file sync over TCP")]
struct Args {
    /// IP address of the other peer
    #[arg(long)]
    ip: String,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to dial and listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Working directory for the share directory and record file
    #[arg(long)]
    root: Option<PathBuf>,

    /// Share directory, relative to the root
    #[arg(long)]
    share: Option<PathBuf>,

    /// Record file, relative to the root
    #[arg(long)]
    record: Option<PathBuf>,

    /// Largest single socket read while receiving (bytes)
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn sync_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(share) = &self.share {
            config.share_dir = share.clone();
        }
        if let Some(record) = &self.record {
            config.record_file = record.clone();
        }
        if let Some(buffer_size) = self.buffer_size {
            config.receive_buffer_size = buffer_size;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,pairsync_daemon=debug,pairsync_core=debug"
    } else {
        "info,pairsync_daemon=info,pairsync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.sync_config()?;

    info!("Starting pairsync");
    info!("Peer: {}:{}", args.ip, config.port);
    info!("Share directory: {:?}", config.share_path());

    let share_path = config.share_path();
    std::fs::create_dir_all(&share_path)
        .with_context(|| format!("Failed to create share directory: {:?}", share_path))?;

    let recorder = Recorder::open(&config.root, &config.share_dir, &config.record_file)
        .context("Failed to open transfer records")?;
    info!("Loaded {} transfer record(s)", recorder.len());

    let link = PeerLink::new(config.link_config(args.ip.clone()));
    let mut daemon = Daemon::new(link, recorder, &config);

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::select! {
        result = daemon.run() => result,

        // Handle graceful shutdown
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
