//! Huddle relay
//!
//! Serves room channels for Huddle clients: fans messages out within a
//! room, answers sync requests from a server-side document replica and
//! routes mesh signals between peers.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:7070
//! huddle-relay
//!
//! # Custom address
//! huddle-relay --bind 127.0.0.1 --port 9000
//!
//! # With configuration file (flags win over file values)
//! huddle-relay --config /etc/huddle/relay.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use huddle_core::RoomManager;
use huddle_transport::RelayServer;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7070;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

/// Huddle relay - real-time collaboration rooms
#[derive(Parser, Debug)]
#[command(name = "huddle-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, env = "HUDDLE_BIND")]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long, env = "HUDDLE_PORT")]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, env = "HUDDLE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Seconds between sweeps for empty rooms
    #[arg(long)]
    gc_interval: Option<u64>,
}

/// Optional TOML configuration file
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct FileConfig {
    bind: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    gc_interval_secs: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Effective settings after merging flags over the file
#[derive(Debug, PartialEq)]
struct Settings {
    addr: SocketAddr,
    log_level: String,
    gc_interval: Duration,
}

impl Settings {
    fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        let bind = args.bind.or(file.bind).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let port = args.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let addr: SocketAddr = format!("{}:{}", bind, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", bind, port))?;

        Ok(Self {
            addr,
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            gc_interval: Duration::from_secs(
                args.gc_interval
                    .or(file.gc_interval_secs)
                    .unwrap_or(DEFAULT_GC_INTERVAL_SECS)
                    .max(1),
            ),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(args, file)?;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let manager = Arc::new(RoomManager::new());
    info!(addr = %settings.addr, "Starting Huddle relay");

    let (addr, _server) = RelayServer::new(manager.clone()).bind(settings.addr).await?;
    info!(addr = %addr, "Relay ready");

    // Rooms are released when their last member leaves; this catches any
    // that emptied between releases
    let gc_manager = manager.clone();
    let gc_interval = settings.gc_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gc_interval);
        loop {
            interval.tick().await;
            let removed = gc_manager.gc();
            if removed > 0 {
                let stats = gc_manager.stats();
                info!(
                    removed,
                    rooms = stats.room_count,
                    connections = stats.connection_count,
                    "GC: removed empty rooms"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╦ ╦╦ ╦╔╦╗╔╦╗╦  ╔═╗
  ╠═╣║ ║ ║║ ║║║  ║╣
  ╩ ╩╚═╝═╩╝═╩╝╩═╝╚═╝
  Real-time collaboration relay
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
