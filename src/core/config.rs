//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI overrides.
//! A node runs as a server, a client, or both (local-only use needs
//! neither section).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store and notification queue settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Server-side listener settings.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Client-side connection settings.
    #[serde(default)]
    pub client: Option<ClientConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Store and notification queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Soft capacity of the event dispatch queue. Writers wait for space
    /// below this watermark before mutating.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Emit an Update event even when a write sets a value equal to the
    /// current one. When false, equal-value writes are successful no-ops.
    #[serde(default = "default_notify_on_unchanged")]
    pub notify_on_unchanged: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            notify_on_unchanged: default_notify_on_unchanged(),
        }
    }
}

/// Server-side listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g. "0.0.0.0:1735").
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub connect: String,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl ClientConfig {
    /// Reconnect backoff as a Duration.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_queue_capacity() -> usize {
    4096
}

fn default_notify_on_unchanged() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:1735".to_string()
}

fn default_reconnect_backoff_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref bind) = overrides.bind {
            match self.server {
                Some(ref mut server) => server.bind = bind.clone(),
                None => self.server = Some(ServerConfig { bind: bind.clone() }),
            }
        }
        if let Some(ref connect) = overrides.connect {
            match self.client {
                Some(ref mut client) => client.connect = connect.clone(),
                None => {
                    self.client = Some(ClientConfig {
                        connect: connect.clone(),
                        reconnect_backoff_ms: default_reconnect_backoff_ms(),
                    })
                }
            }
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_server()?;
        self.validate_client()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.queue_capacity == 0 {
            anyhow::bail!("store.queue_capacity must be > 0");
        }
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if let Some(ref server) = self.server {
            server
                .bind
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("server.bind is not a socket address: {}", server.bind))?;
        }
        Ok(())
    }

    fn validate_client(&self) -> Result<()> {
        if let Some(ref client) = self.client {
            client.connect.parse::<std::net::SocketAddr>().with_context(|| {
                format!("client.connect is not a socket address: {}", client.connect)
            })?;
            if client.reconnect_backoff_ms == 0 {
                anyhow::bail!("client.reconnect_backoff_ms must be > 0");
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override server bind address.
    pub bind: Option<String>,
    /// Override client connect address.
    pub connect: Option<String>,
}
