//! mfs Bus Server
//!
//! Standalone WebSocket publish/subscribe relay for mfs daemons.
//!
//! # Usage
//!
//! ```bash
//! # Accept any client
//! mfs-bus --port 4443
//!
//! # Require a shared token
//! mfs-bus --port 4443 --token s3cret
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mfs_bus::{BusServer, ServerOptions};
use mfs_core::Config;

#[derive(Parser, Debug)]
#[command(name = "mfs-bus")]
#[command(about = "mfs publish/subscribe relay")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Token clients must present
    #[arg(short, long, env = "MFS_BUS_TOKEN")]
    token: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let mut server_config = config.server;
    if let Some(port) = args.port {
        server_config.port = port;
    }
    if let Some(bind) = &args.bind {
        server_config.bind = bind.parse()?;
    }
    if args.token.is_some() {
        server_config.token = args.token;
    }

    let addr = SocketAddr::new(server_config.bind, server_config.port);
    let options = ServerOptions::from(&server_config);

    info!("Starting mfs bus server");
    if options.token.is_none() {
        info!("No token configured, accepting all clients");
    }

    let server = BusServer::new(options);
    server.serve(addr).await?;

    Ok(())
}
