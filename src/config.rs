//! # Configuration Management
//!
//! Centralized configuration for a peer's transport layer.
//!
//! ## Sections
//! - **server**: which addresses and ports the channel server binds, and how many TCP
//!   clients are serviced at once
//! - **connection**: idle windows and connect timeouts used by outgoing requests, plus the
//!   application version stamped on every request
//! - **logging**: subscriber setup for `tracing`
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment variables via `from_env()`
//! - Direct instantiation with defaults, optionally through `default_with_overrides()`
//!
//! Durations are written as milliseconds. A zero idle window disables idle detection for
//! that transport.

use crate::core::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Port used for both TCP and UDP when nothing else is configured.
pub const DEFAULT_PORT: u16 = 7700;

/// Number of TCP service loops per listener.
pub const DEFAULT_MAX_TCP_CLIENTS: usize = 4;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// Recognized variables: `PEERWIRE_TCP_PORT`, `PEERWIRE_UDP_PORT`,
    /// `PEERWIRE_LISTEN_ADDRESSES` (comma separated), `PEERWIRE_IDLE_TCP_MS`,
    /// `PEERWIRE_IDLE_UDP_MS`, `PEERWIRE_CONNECTION_TIMEOUT_TCP_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PEERWIRE_TCP_PORT") {
            config.server.tcp_port = parse_env("PEERWIRE_TCP_PORT", &port)?;
        }

        if let Ok(port) = std::env::var("PEERWIRE_UDP_PORT") {
            config.server.udp_port = parse_env("PEERWIRE_UDP_PORT", &port)?;
        }

        if let Ok(addresses) = std::env::var("PEERWIRE_LISTEN_ADDRESSES") {
            config.server.addresses = addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            config.server.listen_any = config.server.addresses.is_empty();
        }

        if let Ok(idle) = std::env::var("PEERWIRE_IDLE_TCP_MS") {
            config.connection.idle_tcp =
                Duration::from_millis(parse_env("PEERWIRE_IDLE_TCP_MS", &idle)?);
        }

        if let Ok(idle) = std::env::var("PEERWIRE_IDLE_UDP_MS") {
            config.connection.idle_udp =
                Duration::from_millis(parse_env("PEERWIRE_IDLE_UDP_MS", &idle)?);
        }

        if let Ok(timeout) = std::env::var("PEERWIRE_CONNECTION_TIMEOUT_TCP_MS") {
            config.connection.connection_timeout_tcp = Duration::from_millis(parse_env(
                "PEERWIRE_CONNECTION_TIMEOUT_TCP_MS",
                &timeout,
            )?);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: '{value}'")))
}

/// Channel server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind the wildcard address instead of `addresses`
    pub listen_any: bool,

    /// Interface addresses to bind when `listen_any` is false
    #[serde(default)]
    pub addresses: Vec<String>,

    /// TCP port, 0 picks an ephemeral port
    pub tcp_port: u16,

    /// UDP port, 0 picks an ephemeral port
    pub udp_port: u16,

    /// Concurrent service loops per TCP listener
    pub max_tcp_clients: usize,

    /// Skip binding entirely (peer behind a relay)
    #[serde(default)]
    pub disable_bind: bool,

    /// Largest TCP frame accepted
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_any: true,
            addresses: Vec::new(),
            tcp_port: DEFAULT_PORT,
            udp_port: DEFAULT_PORT,
            max_tcp_clients: DEFAULT_MAX_TCP_CLIENTS,
            disable_bind: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.listen_any && !self.disable_bind && self.addresses.is_empty() {
            errors.push("No listen addresses configured and listen_any is false".to_string());
        }

        for address in &self.addresses {
            if address.parse::<IpAddr>().is_err() {
                errors.push(format!(
                    "Invalid listen address: '{address}' (expected an IP such as '192.168.1.10')"
                ));
            }
        }

        if self.max_tcp_clients == 0 {
            errors.push("Max TCP clients must be greater than 0".to_string());
        } else if self.max_tcp_clients > 10_000 {
            errors.push(format!(
                "Max TCP clients very high: {} (ensure system resources can support this)",
                self.max_tcp_clients
            ));
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        errors
    }

    /// The TCP and UDP endpoints to bind, TCP first for each interface.
    ///
    /// Unparsable addresses are skipped here; `validate` reports them.
    pub fn bind_addresses(&self) -> Vec<(SocketAddr, SocketAddr)> {
        if self.listen_any {
            let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
            return vec![(
                SocketAddr::new(any, self.tcp_port),
                SocketAddr::new(any, self.udp_port),
            )];
        }
        self.addresses
            .iter()
            .filter_map(|a| a.parse::<IpAddr>().ok())
            .map(|ip| {
                (
                    SocketAddr::new(ip, self.tcp_port),
                    SocketAddr::new(ip, self.udp_port),
                )
            })
            .collect()
    }
}

/// Client-side connection settings used when sending requests
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Idle window of a TCP request channel
    #[serde(with = "millis")]
    pub idle_tcp: Duration,

    /// How long to wait for each UDP reply datagram
    #[serde(with = "millis")]
    pub idle_udp: Duration,

    /// TCP connect timeout
    #[serde(with = "millis")]
    pub connection_timeout_tcp: Duration,

    /// Application version stamped on outgoing requests (24 bits)
    pub version: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_tcp: timeout::DEFAULT_IDLE_TCP,
            idle_udp: timeout::DEFAULT_IDLE_UDP,
            connection_timeout_tcp: timeout::DEFAULT_CONNECTION_TIMEOUT_TCP,
            version: 1,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.version > crate::core::message::MAX_VERSION {
            errors.push(format!(
                "Version {} does not fit 24 bits (maximum: {})",
                self.version,
                crate::core::message::MAX_VERSION
            ));
        }

        if self.idle_tcp.as_secs() > 3600 {
            errors.push("TCP idle window too long (maximum: 1 hour)".to_string());
        }

        if self.idle_udp.as_secs() > 3600 {
            errors.push("UDP idle window too long (maximum: 1 hour)".to_string());
        }

        if !self.connection_timeout_tcp.is_zero() && self.connection_timeout_tcp.as_millis() < 10 {
            errors.push("TCP connection timeout too short (minimum: 10ms)".to_string());
        } else if self.connection_timeout_tcp.as_secs() > 300 {
            errors.push("TCP connection timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Durations as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Line format of emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Subscriber setup for [`crate::utils::logging::init_logging`]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Minimum level; `RUST_LOG` takes precedence when set
    #[serde(with = "level")]
    pub level: Level,

    pub format: LogFormat,

    /// Write events to stdout
    pub stdout: bool,

    /// Also append events to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Plain,
            stdout: true,
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match &self.file {
            None if !self.stdout => {
                errors.push("No log output: stdout is off and no log file is set".to_string());
            }
            Some(path) => {
                let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
                if let Some(dir) = dir.filter(|d| !d.is_dir()) {
                    errors.push(format!("Log file directory does not exist: {}", dir.display()));
                }
            }
            None => {}
        }

        errors
    }
}

/// `tracing::Level` as a lowercase name such as `"debug"`.
mod level {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level '{name}'")))
    }
}
