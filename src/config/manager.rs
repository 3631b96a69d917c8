//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MAX_TIMEOUT: Duration = Duration::from_secs(3600);
const MIN_LINE_LENGTH: usize = 16;
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve a bind address given on the command line. Accepts
    /// `ip:port`, `host:port`, or a bare `:port` which binds every interface.
    pub async fn resolve_bind_addr(bind: &str) -> Result<SocketAddr> {
        if let Ok(addr) = bind.parse::<SocketAddr>() {
            return Ok(addr);
        }

        if let Some(port) = bind.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in bind address: {}", bind))?;
            return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
        }

        let addr = tokio::net::lookup_host(bind)
            .await
            .with_context(|| format!("Failed to resolve bind address: {}", bind))?
            .next()
            .with_context(|| format!("Bind address {} resolved to no addresses", bind))?;
        tracing::debug!("Resolved {} to {}", bind, addr);
        Ok(addr)
    }
}

impl Config {
    /// Apply `LINERELAY_*` overrides using `lookup` to resolve variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = lookup("LINERELAY_BIND_ADDR") {
            self.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid LINERELAY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(max_conn) = lookup("LINERELAY_MAX_CONNECTIONS") {
            self.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid LINERELAY_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(timeout) = lookup("LINERELAY_SHUTDOWN_TIMEOUT") {
            self.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid LINERELAY_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = lookup("LINERELAY_WRITE_TIMEOUT") {
            self.server.write_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid LINERELAY_WRITE_TIMEOUT: {}", timeout))?;
        }

        if let Some(len) = lookup("LINERELAY_MAX_LINE_LENGTH") {
            self.server.max_line_length = len
                .parse::<usize>()
                .with_context(|| format!("Invalid LINERELAY_MAX_LINE_LENGTH: {}", len))?;
        }

        if let Some(level) = lookup("LINERELAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        if self.client.connect_timeout.is_zero() {
            bail!("client.connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;

        if server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if server.max_connections > 100_000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        for (name, value) in [
            ("write_timeout", server.write_timeout),
            ("shutdown_timeout", server.shutdown_timeout),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than 0", name);
            }
            if value > MAX_TIMEOUT {
                bail!("{} cannot exceed 1 hour", name);
            }
        }

        if server.max_line_length < MIN_LINE_LENGTH {
            bail!("max_line_length must be at least {} bytes", MIN_LINE_LENGTH);
        }

        if server.max_line_length > MAX_LINE_LENGTH {
            bail!("max_line_length cannot exceed 16MB");
        }

        if server.rejection_message.is_empty() {
            bail!("rejection_message must not be empty");
        }

        if server.rejection_message.contains('\n') {
            bail!("rejection_message must be a single line");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments. `bind` comes from
    /// [`ConfigManager::resolve_bind_addr`].
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<SocketAddr>,
        port: Option<u16>,
        max_connections: Option<usize>,
        log_level: Option<&str>,
    ) {
        if let Some(addr) = bind {
            self.server.bind_addr = addr;
            tracing::info!("CLI override: bind address set to {}", addr);
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}
