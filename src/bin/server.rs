//! Dummy SMTP Server Binary

use anyhow::Result;
use clap::Parser;
use dummy_smtp::config::{ServerConfig, generate_example_config};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Dummy SMTP Server
#[derive(Parser, Debug)]
#[command(name = "dummy-smtp")]
#[command(about = "SMTP test double that saves every submitted message to disk")]
#[command(version = dummy_smtp::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// SHA-256 thumbprint of the certificate to offer with STARTTLS
    #[arg(short, long)]
    thumbprint: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Print an example configuration file and exit
    #[arg(long)]
    example_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", generate_example_config());
        return Ok(());
    }

    // Initialize logging
    let level = if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load config
    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        info!("No config file found, using defaults");
        ServerConfig::default()
    };

    if let Some(thumbprint) = args.thumbprint {
        config.cert_thumbprint = Some(thumbprint);
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    info!("Dummy SMTP {}", dummy_smtp::VERSION);
    if config.cert_thumbprint.is_none() {
        info!("No certificate thumbprint given, STARTTLS disabled");
    }

    // Run server
    dummy_smtp::server::run_server(config).await?;

    Ok(())
}
