//! Carrier-mux server
//!
//! Accepts carrier connections, authenticates clients against the
//! configured credential table and proxies tunneled streams and DNS
//! lookups to their targets.

use anyhow::{anyhow, Context, Result};
use carrier_mux::Config;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Carrier-mux server - multiplexed stream tunneling
#[derive(Parser, Debug)]
#[command(name = "cmux-server")]
#[command(about = "Multiplexed tunnel server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if server_config.auth.is_empty() {
        warn!("auth table is empty: accepting any client");
    }

    let listen = args.listen.unwrap_or_else(|| server_config.listen.clone());
    let server = server_config.build_server()?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("carrier-mux server {} listening on {}", carrier_mux::VERSION, listen);

    server.serve(listener).await?;
    Ok(())
}
