//! mfsd - Replicate a directory across hosts
//!
//! Usage:
//!   mfsd run -p <path> -s <server>    Replicate a directory
//!   mfsd bus                          Run a bus server
//!   mfsd config                       Print a sample config file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mfs_bus::{BusServer, ServerOptions};
use mfs_core::{Config, SyncRole};
use mfs_daemon::{MessageBus, Replicator, ReplicatorConfig, WsBus};

#[derive(Parser)]
#[command(name = "mfsd")]
#[command(about = "Replicated directory tree over a message bus", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a directory
    Run {
        /// Directory to replicate
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Flush interval (e.g. 2s, 500ms; bare numbers are seconds)
        #[arg(short, long, value_parser = parse_interval)]
        interval: Option<Duration>,

        /// Bus authentication token
        #[arg(short, long, env = "MFS_BUS_TOKEN")]
        token: Option<String>,

        /// Bus endpoint, may be repeated
        #[arg(short, long = "server")]
        servers: Vec<String>,

        /// Identity of this host (default: hostname)
        #[arg(long)]
        host_id: Option<String>,

        /// Join role: responder, requester or disabled
        #[arg(long)]
        role: Option<SyncRole>,

        /// Seconds to wait for a join snapshot before giving up
        #[arg(long)]
        join_timeout: Option<u64>,

        /// Config file (defaults to the platform config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a bus server
    Bus {
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
    },

    /// Print a sample config file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Commands::Run {
            path,
            interval,
            token,
            servers,
            host_id,
            role,
            join_timeout,
            config,
        } => {
            let mut config = load_config(config)?;
            if let Some(path) = path {
                config.node.root = path;
            }
            if let Some(interval) = interval {
                config.sync.interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
            }
            if let Some(token) = token {
                config.bus.token = token;
            }
            if !servers.is_empty() {
                config.bus.endpoints = servers;
            }
            if host_id.is_some() {
                config.node.host_id = host_id;
            }
            if let Some(role) = role {
                config.node.role = role;
            }
            if join_timeout.is_some() {
                config.sync.join_timeout_secs = join_timeout;
            }
            run_node(config).await?;
        }
        Commands::Bus {
            port,
            bind,
            token,
            config,
        } => {
            let mut server = load_config(config)?.server;
            if let Some(port) = port {
                server.port = port;
            }
            if let Some(bind) = bind {
                server.bind = bind.parse()?;
            }
            if token.is_some() {
                server.token = token;
            }
            run_bus(SocketAddr::new(server.bind, server.port), ServerOptions::from(&server))
                .await?;
        }
        Commands::Config => {
            print!("{}", Config::sample());
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load(),
    })
}

async fn run_node(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let node = ReplicatorConfig::from_config(&config);

    info!("Starting mfs node...");
    info!("  Replicating: {:?}", node.root);
    info!("  Host: {}", node.host_id);
    info!("  Role: {}", node.role);
    info!("  Bus: {}", config.bus.endpoints.join(", "));

    let bus = match WsBus::connect(
        &config.bus.endpoints,
        &config.bus.token,
        &node.host_id,
        config.bus.connect_timeout(),
    )
    .await
    {
        Ok(bus) => bus,
        Err(e) => {
            error!("Cannot reach the bus: {}", e);
            return Err(e.into());
        }
    };
    info!("Connected to {} as {}", bus.endpoint(), bus.client_id());
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    let mut replicator = tokio::select! {
        result = Replicator::start(node, bus) => result?,
        _ = signal::ctrl_c() => {
            info!("Interrupted before startup completed");
            return Ok(());
        }
    };

    signal::ctrl_c().await?;
    info!("Shutting down...");
    replicator.shutdown();

    Ok(())
}

async fn run_bus(addr: SocketAddr, options: ServerOptions) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting mfs bus server...");
    info!("  Listening on: ws://{}", addr);

    let server = BusServer::new(options);

    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!("Bus server error: {:?}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Parse `2s`, `500ms`, `1m` or a bare number of seconds
fn parse_interval(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid interval: {:?}", s))?;

    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        other => return Err(format!("unknown interval unit: {:?}", other)),
    };
    if duration.is_zero() {
        return Err("interval must be positive".into());
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("fast").is_err());
        assert!(parse_interval("2h").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "mfsd", "run", "-p", "/data", "-s", "ws://a:4443", "-s", "b:4443", "--role",
            "requester",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                path, servers, role, ..
            } => {
                assert_eq!(path, Some(PathBuf::from("/data")));
                assert_eq!(servers.len(), 2);
                assert_eq!(role, Some(SyncRole::Requester));
            }
            _ => panic!("expected run"),
        }
    }
}
