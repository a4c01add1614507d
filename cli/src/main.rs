//! portbridge: allocate debug ports and relay stdio to a debug server.
//!
//! Three subcommands:
//! - `portbridge allocate`: print a free local port for a child process to listen on
//! - `portbridge forward`: bridge stdin/stdout to a debug server's TCP port
//! - `portbridge ports`: print a validated port range

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use portbridge::{BridgeConfig, ConnectionRelay, PortNumbers, RelayOutcome, parse_port};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// portbridge: local port allocation and stdio relay for debug sessions.
#[derive(Parser)]
#[command(
    name = "portbridge",
    version,
    about = "portbridge: local port allocation and stdio relay for debug sessions"
)]
struct Cli {
    /// Path to portbridge.toml [default: ./portbridge.toml or ~/.config/portbridge/portbridge.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find a free local TCP port and print it
    Allocate {
        /// Preferred port, tried in the order given (repeatable)
        #[arg(short, long = "port", value_parser = parse_port)]
        ports: Vec<u16>,
        /// Preferred port range FROM-TO, tried after --port
        #[arg(short, long, value_parser = parse_range)]
        range: Option<PortNumbers>,
        /// Comma separated ports that must not be returned
        #[arg(short, long, value_parser = parse_port, value_delimiter = ',')]
        exclude: Vec<u16>,
        /// Only check this host instead of every local address
        #[arg(long)]
        host: Option<String>,
    },
    /// Bridge stdin/stdout to a debug server's TCP port
    Forward {
        /// Debug server port [default: 13603]
        #[arg(value_parser = parse_port)]
        port: Option<u16>,
        /// Connection retries after the first attempt [default: 10]
        retries: Option<u32>,
        /// Debug server host [default: 127.0.0.1]
        #[arg(long)]
        host: Option<String>,
        /// Delay between connection attempts in milliseconds [default: 200]
        #[arg(long)]
        retry_delay_ms: Option<u64>,
    },
    /// Print every port in a FROM-TO range
    Ports {
        #[arg(value_parser = parse_range)]
        range: PortNumbers,
    },
}

fn parse_range(value: &str) -> portbridge::Result<PortNumbers> {
    value.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the allocated port or relayed bytes.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(resolve_config(cli.config)).await?;

    match cli.command {
        Commands::Allocate {
            ports,
            range,
            exclude,
            host,
        } => {
            let port = run_allocate(&config, ports, range, exclude, host).await?;
            println!("{}", port);
        }
        Commands::Forward {
            port,
            retries,
            host,
            retry_delay_ms,
        } => {
            let cancel = CancellationToken::new();

            // Ctrl-C handler: stops a pending retry or an active bridge
            let cancel_for_signal = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Stopping relay...");
                cancel_for_signal.cancel();
            });

            let code = match run_forward(&config, port, retries, host, retry_delay_ms, cancel).await
            {
                Ok(_) => 0,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    1
                }
            };
            // The stdin reader may still be parked on a blocking read; don't wait for it.
            std::process::exit(code);
        }
        Commands::Ports { range } => {
            for port in range {
                println!("{}", port);
            }
        }
    }

    Ok(())
}

/// Allocate one port. Flags replace the config's preferred ports and host;
/// exclusions from both sources apply.
async fn run_allocate(
    config: &BridgeConfig,
    ports: Vec<u16>,
    range: Option<PortNumbers>,
    exclude: Vec<u16>,
    host: Option<String>,
) -> Result<u16> {
    let mut request = config
        .allocation_request()
        .map_err(|e| anyhow::anyhow!("Invalid allocator config: {}", e))?;

    if !ports.is_empty() || range.is_some() {
        request.preferred_ports = ports;
        request = request.ports(range.into_iter().flatten());
    }
    request = request.exclude(exclude);
    if let Some(host) = host {
        request.host = Some(host);
    }

    let allocator = config.port_allocator();
    let port = allocator
        .allocate(&request)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to allocate a port: {}", e))?;
    tracing::info!(port, "allocated port");
    Ok(port)
}

/// Connect to the debug server and relay stdin/stdout until either side closes.
async fn run_forward(
    config: &BridgeConfig,
    port: Option<u16>,
    retries: Option<u32>,
    host: Option<String>,
    retry_delay_ms: Option<u64>,
    cancel: CancellationToken,
) -> Result<RelayOutcome> {
    let mut session = config
        .relay_session()
        .map_err(|e| anyhow::anyhow!("Invalid relay config: {}", e))?;
    if let Some(port) = port {
        session.target_port = port;
    }
    if let Some(host) = host {
        session.target_host = host;
    }
    if let Some(retries) = retries {
        session = session.retries(retries);
    }
    if let Some(ms) = retry_delay_ms {
        session = session.retry_delay(Duration::from_millis(ms));
    }

    tracing::info!(
        host = %session.target_host,
        port = session.target_port,
        retries = session.remaining_retries,
        "starting relay"
    );

    let outcome = ConnectionRelay::new(session)
        .run_stdio(cancel)
        .await
        .map_err(|e| anyhow::anyhow!("Relay failed: {}", e))?;

    match outcome {
        RelayOutcome::Closed { sent, received } => {
            tracing::info!(sent, received, "relay finished");
        }
        RelayOutcome::Stopped => {
            tracing::info!("relay stopped");
        }
    }
    Ok(outcome)
}

/// Resolve config file path: explicit flag → ./portbridge.toml →
/// ~/.config/portbridge/portbridge.toml. `None` means built-in defaults.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }

    let local = Path::new("portbridge.toml");
    if local.exists() {
        return Some(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("portbridge").join("portbridge.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    None
}

/// Load and validate a portbridge.toml config file, or fall back to defaults.
async fn load_config(config_path: Option<PathBuf>) -> Result<BridgeConfig> {
    let Some(config_path) = config_path else {
        tracing::debug!("no config file found, using defaults");
        return Ok(BridgeConfig::default());
    };

    let content = tokio::fs::read_to_string(&config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config = BridgeConfig::from_toml(&content)
        .map_err(|e| anyhow::anyhow!("Failed to load config file {:?}: {}", config_path, e))?;
    tracing::debug!(path = %config_path.display(), "loaded config");
    Ok(config)
}
