//! # Configuration Management
//!
//! Centralized configuration for the session client.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Protocol version announced in the logon request
pub const PROTOCOL_VERSION: u32 = 65575;

/// Default service endpoint
pub const DEFAULT_SERVICE_HOST: &str = "162.254.195.44";
pub const DEFAULT_SERVICE_PORT: u16 = 27020;

/// Max allowed frame payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default bound of the event bus queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Payloads at or below this size get a 16-bit datagram checksum
pub const DEFAULT_SHORT_CHECKSUM_LIMIT: usize = 64;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub events: EventBusConfig,

    #[serde(default)]
    pub datagram: DatagramConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("SESSION_PROTOCOL_HOST") {
            config.client.host = host;
        }

        if let Ok(port) = std::env::var("SESSION_PROTOCOL_PORT") {
            config.client.port = port
                .parse::<u16>()
                .map_err(|e| ProtocolError::ConfigError(format!("Invalid port '{port}': {e}")))?;
        }

        if let Ok(timeout) = std::env::var("SESSION_PROTOCOL_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("SESSION_PROTOCOL_REQUEST_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.request_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(capacity) = std::env::var("SESSION_PROTOCOL_EVENT_QUEUE_CAPACITY") {
            if let Ok(val) = capacity.parse::<usize>() {
                config.events.queue_capacity = val;
            }
        }

        if let Ok(addr) = std::env::var("SESSION_PROTOCOL_DATAGRAM_ADDRESS") {
            config.datagram.enabled = true;
            config.datagram.address = addr;
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

    /// Validate the configuration; an empty list means it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.events.validate());
        errors.extend(self.datagram.validate());
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

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service host
    pub host: String,

    /// Service port
    pub port: u16,

    /// Timeout for the transport to reach an established link
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout applied by `PendingResponse::with_timeout` callers
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Heartbeat interval used when a logon response carries none
    #[serde(with = "duration_serde")]
    pub default_heartbeat_interval: Duration,

    /// Protocol version sent with logon
    pub protocol_version: u32,

    /// Routing identifier used by `send`/`request`
    pub app_id: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from(DEFAULT_SERVICE_HOST),
            port: DEFAULT_SERVICE_PORT,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            request_timeout: timeout::REQUEST_TIMEOUT,
            default_heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            protocol_version: PROTOCOL_VERSION,
            app_id: 0,
        }
    }
}

impl ClientConfig {
    /// `host:port` as handed to the transport
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("Client host cannot be empty".to_string());
        }

        if self.port == 0 {
            errors.push("Client port cannot be 0".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.request_timeout.as_millis() < 100 {
            errors.push("Request timeout too short (minimum: 100ms)".to_string());
        }

        if self.default_heartbeat_interval.as_secs() < 1 {
            errors.push("Heartbeat interval too short (minimum: 1s)".to_string());
        } else if self.default_heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.protocol_version == 0 {
            errors.push("Protocol version cannot be 0".to_string());
        }

        errors
    }
}

/// What the event bus does when its queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the emission that did not fit and count it
    #[default]
    DropNewest,
    /// Evict the oldest queued invocation to make room
    DropOldest,
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Maximum queued invocations before the overflow policy applies
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropNewest,
        }
    }
}

impl EventBusConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.queue_capacity == 0 {
            errors.push("Event queue capacity must be greater than 0".to_string());
        } else if self.queue_capacity > 10_000_000 {
            errors.push(format!(
                "Event queue capacity too large: {} (max recommended: 10,000,000)",
                self.queue_capacity
            ));
        }

        errors
    }
}

/// Auxiliary datagram channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatagramConfig {
    /// Whether the client opens the datagram channel on connect
    pub enabled: bool,

    /// Remote datagram address (e.g., "162.254.195.44:27017")
    pub address: String,

    /// Largest payload that is checked with the 16-bit CRC
    pub short_checksum_limit: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::from("127.0.0.1:27017"),
            short_checksum_limit: DEFAULT_SHORT_CHECKSUM_LIMIT,
        }
    }
}

impl DatagramConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.enabled && self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid datagram address format: '{}' (expected format: '10.0.0.1:27017')",
                self.address
            ));
        }

        if self.short_checksum_limit > u16::MAX as usize {
            errors.push(format!(
                "Short checksum limit too large: {} (maximum: {})",
                self.short_checksum_limit,
                u16::MAX
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("session-protocol"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
