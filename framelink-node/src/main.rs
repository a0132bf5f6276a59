//! framelink echo node entry point.
//!
//! ```text
//! framelink-node serve                      Run the echo service (foreground)
//! framelink-node call --count 5 hello       Send requests to a node
//! framelink-node --config <path> ...        Load a custom config TOML
//! framelink-node --gen-config [path]        Write default config to stdout or a file
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framelink_core::{Client, LinkError};
use framelink_node::config::NodeConfig;
use framelink_node::service::EchoService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "framelink-node", about = "framelink echo node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "framelink-node.toml")]
    config: PathBuf,

    /// Write the default configuration to PATH (stdout if omitted) and exit.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    gen_config: Option<Option<PathBuf>>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept connections and echo requests back.
    Serve,
    /// Dial a node and issue requests.
    Call {
        /// Peer address; defaults to `network.connect` from the config.
        #[arg(short, long)]
        addr: Option<SocketAddr>,
        /// Number of requests to send.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        /// Request payload.
        #[arg(default_value = "ping")]
        payload: String,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    match cli.gen_config {
        Some(Some(path)) => {
            NodeConfig::write_default(&path)?;
            println!("wrote default config to {}", path.display());
            return Ok(());
        }
        Some(None) => {
            let text = toml::to_string_pretty(&NodeConfig::default())?;
            println!("{text}");
            return Ok(());
        }
        None => {}
    }

    // Load config.
    let config = NodeConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("framelink-node v{}", env!("CARGO_PKG_VERSION"));

    match cli.mode.unwrap_or(Mode::Serve) {
        Mode::Serve => serve(config).await,
        Mode::Call {
            addr,
            count,
            payload,
        } => {
            let addr = match addr {
                Some(addr) => addr,
                None => config.network.connect.parse()?,
            };
            call(config, addr, count, payload).await
        }
    }
}

async fn serve(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "listen: {}:{} (max {} sessions)",
        config.network.listen_addr, config.network.listen_port, config.network.max_connections
    );

    let service = EchoService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await
}

async fn call(
    config: NodeConfig,
    addr: SocketAddr,
    count: u32,
    payload: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect(addr, config.link.clone()).await?;
    info!("connected to {addr}");

    let mut failures = 0u32;
    for i in 0..count {
        let started = Instant::now();
        match client.call(payload.clone().into_bytes()).await {
            Ok(reply) => println!(
                "#{i}: {} ({} bytes, {:?})",
                String::from_utf8_lossy(&reply),
                reply.len(),
                started.elapsed()
            ),
            Err(LinkError::Rejected(reason)) => {
                failures += 1;
                println!("#{i}: rejected: {reason}");
            }
            Err(e) => {
                failures += 1;
                warn!("request #{i} failed: {e}");
            }
        }
    }

    let reason = client.disconnect().await?;
    info!("disconnected: {reason}");
    if failures > 0 {
        return Err(format!("{failures} of {count} requests failed").into());
    }
    Ok(())
}
