//! LineRelay - line-oriented TCP broadcast relay
//!
//! `linerelay host` runs the relay, `linerelay join` connects a terminal to one.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use linerelay::config::{ConfigManager, LoggingConfig};
use linerelay::{client, Config, RelayServer};

/// CLI arguments for LineRelay
#[derive(Parser, Debug)]
#[command(name = "linerelay")]
#[command(about = "LineRelay - line-oriented TCP broadcast relay")]
#[command(version)]
#[command(long_about = "
LineRelay - line-oriented TCP broadcast relay

Every newline-terminated line a client sends is relayed to all other
connected clients as '<sender address> -> <line>'.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  LINERELAY_BIND_ADDR          - Bind address (e.g., 127.0.0.1:7878)
  LINERELAY_MAX_CONNECTIONS    - Maximum concurrent connections
  LINERELAY_SHUTDOWN_TIMEOUT   - Drain timeout on shutdown (e.g., 5s)
  LINERELAY_WRITE_TIMEOUT      - Per-peer write timeout (e.g., 5s)
  LINERELAY_MAX_LINE_LENGTH    - Maximum line length in bytes
  LINERELAY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "linerelay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a relay server
    Host(HostArgs),
    /// Connect this terminal to a relay
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// Address to listen on, e.g. 127.0.0.1:7878 or :7878
    pub bind: Option<String>,

    /// Port to bind to (overrides the address's port)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(short, long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    /// Relay address, e.g. 127.0.0.1:7878
    pub addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Some("debug")
    } else {
        args.log_level.as_deref()
    };

    // Initialize tracing; the configured level and colors apply once loaded
    let apply_logging = init_tracing(log_level.unwrap_or("info"))?;

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    match args.command {
        Command::Host(host) => {
            let bind = match host.bind.as_deref() {
                Some(bind) => Some(ConfigManager::resolve_bind_addr(bind).await?),
                None => None,
            };
            config.merge_with_cli_args(bind, host.port, host.max_connections, log_level);
            config
                .validate()
                .context("Final configuration validation failed")?;
            apply_logging(&config.logging)?;

            if host.validate_config {
                info!("Configuration is valid");
                info!("  Bind address: {}", config.server.bind_addr);
                info!("  Max connections: {}", config.server.max_connections);
                info!("  Write timeout: {:?}", config.server.write_timeout);
                info!("  Max line length: {} bytes", config.server.max_line_length);
                return Ok(());
            }

            host_relay(config).await
        }
        Command::Join(join) => {
            config.merge_with_cli_args(None, None, None, log_level);
            config
                .validate()
                .context("Final configuration validation failed")?;
            apply_logging(&config.logging)?;

            let end = client::join(&join.addr, config.client.connect_timeout).await?;
            info!("Session ended: {:?}", end);
            Ok(())
        }
    }
}

async fn host_relay(config: Config) -> Result<()> {
    info!("Starting LineRelay v{}", env!("CARGO_PKG_VERSION"));

    let server = RelayServer::with_config(Arc::new(config))
        .await
        .context("Failed to start relay")?;

    info!(
        "Relay started on {}; press Ctrl+C or send SIGTERM to stop",
        server.local_addr()
    );
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging at `level`.
///
/// Returns a hook that switches to the loaded logging config. `RUST_LOG`
/// still wins over the configured level.
fn init_tracing(level: &str) -> Result<impl FnOnce(&LoggingConfig) -> Result<()>> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_overridden = from_env.is_some();
    let env_filter = from_env.unwrap_or_else(|| EnvFilter::new(level));

    let (filter, filter_handle) = reload::Layer::new(env_filter);
    let (output, output_handle) = reload::Layer::new(fmt_layer(true));

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(move |logging: &LoggingConfig| {
        if !env_overridden {
            filter_handle
                .reload(EnvFilter::new(&logging.level))
                .context("Failed to apply log level")?;
        }
        output_handle
            .reload(fmt_layer(logging.ansi))
            .context("Failed to apply log format")?;
        Ok(())
    })
}

fn fmt_layer(ansi: bool) -> impl Layer<Registry> + Send + Sync {
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
}
