//! Camlink control server
//!
//! Listens for operator connections and drives the managed video session:
//! wire config capture, relay connect (proxy tunnel, TLS, bounce
//! handshake), capture start/stop, and status pings.

use anyhow::{Context, Result};
use camlink::capture::NullCapture;
use camlink::config::Config;
use camlink::server::ControlServer;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Camlink control server
#[derive(Parser, Debug)]
#[command(name = "camlink-server")]
#[command(about = "Control server for the teleoperated camera relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Control port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let port = args.port.unwrap_or(config.server.port);
    info!(version = camlink::VERSION, port, "starting camlink control server");

    // No media pipeline is linked into this binary; the control protocol
    // and relay link run in full against the null backend.
    let server = Arc::new(ControlServer::new(
        Arc::new(NullCapture),
        config.relay.clone(),
    ));

    server.run(port).await.context("control server failed")?;
    Ok(())
}
