//! Mirage Relay
//!
//! Local UDP relay that disguises WireGuard-style tunnel traffic:
//! - Obfuscates every packet with a shared key
//! - Optionally masks the stream as STUN NAT-traversal traffic
//! - Tracks handshake progress and publishes a status line

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mirage_relay::{masking, Relay, RelaySettings, RelayStatus};
use std::path::Path;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Mirage Relay - UDP obfuscating relay for tunnel traffic
#[derive(Parser, Debug)]
#[command(name = "mirage-relay")]
#[command(about = "UDP relay that disguises tunnel handshake and data packets")]
#[command(version)]
struct Args {
    /// Settings file path
    #[arg(short, long, default_value = "relay.toml")]
    config: String,

    /// Local listen port (loopback), overrides settings
    #[arg(short, long)]
    listen_port: Option<u16>,

    /// Remote tunnel endpoint as host:port, overrides settings
    #[arg(short, long)]
    remote: Option<String>,

    /// Obfuscation key, overrides settings
    #[arg(short, long)]
    key: Option<String>,

    /// Masking strategy id (see --list-maskings), overrides settings
    #[arg(short, long)]
    masking: Option<String>,

    /// Import an exported configuration blob (e.g. scanned from a QR code)
    /// from a file and persist it to the settings file
    #[arg(long)]
    import: Option<String>,

    /// List registered masking strategies and exit
    #[arg(long)]
    list_maskings: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.list_maskings {
        for kind in masking::all() {
            println!("{:<8} {}", kind.id, kind.label);
        }
        return Ok(());
    }

    // Load persisted settings when present, start from defaults otherwise.
    let mut settings = if Path::new(&args.config).exists() {
        RelaySettings::load(&args.config).context("Failed to load settings file")?
    } else {
        RelaySettings::default()
    };

    // Merge an imported configuration blob and persist it.
    if let Some(import_path) = &args.import {
        let blob = std::fs::read_to_string(import_path)
            .with_context(|| format!("Failed to read import file {}", import_path))?;
        settings
            .apply_import(&blob)
            .context("Failed to parse imported configuration")?;
        settings
            .save(&args.config)
            .context("Failed to save imported settings")?;
        info!("Imported configuration saved to {}", args.config);
    }

    // Command-line overrides
    if let Some(port) = args.listen_port {
        settings.listen_port = Some(port);
    }
    if let Some(remote) = &args.remote {
        let (host, port) = remote
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("--remote expects host:port, got '{}'", remote))?;
        settings.remote_host = Some(host.to_string());
        settings.remote_port = Some(port.parse().context("Invalid remote port")?);
    }
    if let Some(key) = &args.key {
        settings.key = Some(key.clone());
    }
    if let Some(id) = &args.masking {
        match masking::resolve(id) {
            Some(kind) => settings.masking = kind.id.to_string(),
            None => warn!("Unknown masking '{}', using no masking", id),
        }
    }

    let config = settings.validate().context("Incomplete configuration")?;

    info!("Mirage Relay v{}", mirage_relay::VERSION);
    info!(
        "Listening on 127.0.0.1:{}, remote {}:{}",
        config.listen_port, config.remote_host, config.remote_port
    );

    let (status_tx, mut status_rx) = watch::channel(RelayStatus::default());
    let relay = Relay::bind(&config, status_tx)
        .await
        .context("Failed to start relay")?;

    // Log every status update the engine publishes.
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            match &status.error {
                Some(err) => error!("{}", err),
                None => info!("{}", status.status),
            }
        }
    });

    // Ctrl-C flips the shutdown flag; the engine treats it as a clean stop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    relay.run(shutdown_rx).await?;
    Ok(())
}
