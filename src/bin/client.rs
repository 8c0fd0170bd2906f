//! Dummy SMTP Test Sender Binary

use anyhow::{Context, Result};
use clap::Parser;
use dummy_smtp::client::{Client, Envelope, server_name, tls_connector};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Send one test message to an SMTP server
#[derive(Parser, Debug)]
#[command(name = "dummy-smtp-send")]
#[command(about = "Submit a test message, optionally over STARTTLS")]
#[command(version = dummy_smtp::VERSION)]
struct Args {
    /// Server hostname
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "25")]
    port: u16,

    /// Name sent with EHLO
    #[arg(long, default_value = "dummy-smtp-send")]
    helo: String,

    /// Upgrade the connection with STARTTLS (requires --ca-cert)
    #[arg(long, requires = "ca_cert")]
    starttls: bool,

    /// CA certificate used to verify the server
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Sender address
    #[arg(long, default_value = "test@from.com")]
    from: String,

    /// Recipient address (repeatable)
    #[arg(long, default_value = "test@to.com")]
    to: Vec<String>,

    #[arg(long, default_value = "asubject")]
    subject: String,

    #[arg(long, default_value = "abody")]
    body: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut client = Client::new(&args.helo);
    if args.starttls {
        let ca_path = args
            .ca_cert
            .as_ref()
            .context("--starttls needs --ca-cert")?;
        let ca_pem = tokio::fs::read(ca_path)
            .await
            .with_context(|| format!("reading {}", ca_path.display()))?;
        client = client.with_starttls(tls_connector(&ca_pem)?, server_name(&args.host)?);
    }

    let envelope = Envelope {
        from: args.from.clone(),
        to: args.to.clone(),
    };
    let mut body = vec![
        format!("From: <{}>", args.from),
        format!("To: {}", args.to.iter().map(|t| format!("<{t}>")).collect::<Vec<_>>().join(", ")),
        format!("Subject: {}", args.subject),
        String::new(),
    ];
    body.extend(args.body.lines().map(str::to_string));

    let addr = format!("{}:{}", args.host, args.port);
    info!("Connecting to {}...", addr);
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;

    let replies = client.send(Box::new(stream), &envelope, &body).await?;
    for reply in &replies {
        info!("S: {}", reply);
    }
    info!("Message sent");

    Ok(())
}
