//! # Configuration
//!
//! One [`NetworkConfig`] drives both containers: the `server` section is read by
//! [`Server`](crate::Server), the `client` section by [`Client`](crate::Client), and the
//! `transport` and `logging` sections by both.
//!
//! ## Sources
//! - TOML, via [`NetworkConfig::from_file`] / [`NetworkConfig::from_toml`]; missing
//!   sections fall back to their defaults
//! - `PACKET_LINK_*` environment variables, via [`NetworkConfig::from_env`]
//! - Code, via [`NetworkConfig::default_with_overrides`]
//!
//! Durations are written as integer milliseconds.
//!
//! ## Liveness
//! The inactivity timeout must exceed the heartbeat interval, otherwise idle but
//! healthy connections would be declared lost.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

use crate::error::{ProtocolError, Result};
use crate::transport::TransportKind;
use crate::utils::compression::CompressionKind;
use crate::utils::timeout;

/// Default cap on a frame's payload (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Compression is opt-in
pub const ENABLE_COMPRESSION: bool = false;

/// The secure channel is on unless switched off
pub const ENABLE_ENCRYPTION: bool = true;

const ENV_PREFIX: &str = "PACKET_LINK_";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Value of `PACKET_LINK_<name>`, if set and parsable.
fn env_value<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

impl NetworkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ProtocolError::ConfigError(format!("Invalid TOML: {e}")))
    }

    /// Defaults, overridden by whichever `PACKET_LINK_*` variables are set.
    ///
    /// Values that do not parse are ignored. Timeouts and heartbeats apply to both the
    /// server and client sections.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = env_value("SERVER_ADDRESS") {
            config.server.address = address;
        }
        if let Some(address) = env_value("CLIENT_ADDRESS") {
            config.client.address = address;
        }
        if let Some(limit) = env_value("BACKPRESSURE_LIMIT") {
            config.server.backpressure_limit = limit;
        }
        if let Some(ms) = env_value("CONNECTION_TIMEOUT_MS") {
            config.server.connection_timeout = Duration::from_millis(ms);
            config.client.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("HEARTBEAT_INTERVAL_MS") {
            config.server.heartbeat_interval = Duration::from_millis(ms);
            config.client.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(secure) = env_value("SECURE") {
            config.transport.encryption_enabled = secure;
        }
        if let Some(reconnect) = env_value("AUTO_RECONNECT") {
            config.client.auto_reconnect = reconnect;
        }

        Ok(config)
    }

    /// Defaults with `mutator` applied on top.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML, as a starting point for a file.
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot render config: {e}")))?;
        let path = path.as_ref();
        std::fs::write(path, content).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot write {}: {e}", path.display()))
        })
    }

    /// Every problem found, across all sections. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        [
            self.server.validate(),
            self.client.validate(),
            self.transport.validate(),
            self.logging.validate(),
        ]
        .concat()
    }

    /// [`validate`](Self::validate), folded into a single `ConfigError`.
    pub fn validate_strict(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            problems.join("\n  - ")
        )))
    }
}

/// Accumulates the problems of one section.
#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn require(&mut self, ok: bool, problem: impl Into<String>) {
        if !ok {
            self.0.push(problem.into());
        }
    }

    fn duration(&mut self, what: &str, value: Duration, min: Duration, max: Option<Duration>) {
        if value < min {
            self.0.push(format!("{what} too short (minimum: {min:?})"));
        } else if let Some(max) = max.filter(|max| value > *max) {
            self.0.push(format!("{what} too long (maximum: {max:?})"));
        }
    }

    fn count(&mut self, what: &str, value: usize, max: usize) {
        if value == 0 {
            self.0.push(format!("{what} must be greater than 0"));
        } else if value > max {
            self.0.push(format!("{what} too large: {value} (maximum: {max})"));
        }
    }

    fn socket_addr(&mut self, label: &str, address: &str) {
        if address.is_empty() {
            self.0.push(format!("{label} address cannot be empty"));
        } else if address.parse::<SocketAddr>().is_err() {
            self.0.push(format!(
                "Invalid {label} address format: '{address}' (expected 'host:port', e.g. '127.0.0.1:9000')"
            ));
        }
    }

    fn bluetooth_addr(&mut self, label: &str, address: &str) {
        let octets: Vec<&str> = address.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok());
        self.require(
            valid,
            format!("Invalid {label} bluetooth address: '{address}' (expected 'AA:BB:CC:DD:EE:FF')"),
        );
    }

    fn bluetooth_compiled_in(&mut self) {
        self.require(
            cfg!(feature = "bluetooth"),
            "Bluetooth transport requested but the 'bluetooth' feature is not compiled in",
        );
    }

    fn liveness(&mut self, heartbeat_interval: Duration, connection_timeout: Duration) {
        self.duration(
            "Connection timeout",
            connection_timeout,
            Duration::from_millis(100),
            Some(Duration::from_secs(300)),
        );
        self.duration(
            "Heartbeat interval",
            heartbeat_interval,
            Duration::from_millis(10),
            Some(Duration::from_secs(3600)),
        );
        self.require(
            heartbeat_interval < connection_timeout,
            "Heartbeat interval must be shorter than the connection timeout",
        );
    }
}

/// Which listening transports a server enables. Each is independently toggleable.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnabledTransports {
    pub tcp: bool,
    pub udp: bool,
    pub bluetooth: bool,
}

impl Default for EnabledTransports {
    fn default() -> Self {
        Self {
            tcp: true,
            udp: false,
            bluetooth: false,
        }
    }
}

impl EnabledTransports {
    pub fn any(&self) -> bool {
        self.tcp || self.udp || self.bluetooth
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TCP listen address
    pub address: String,

    pub udp_address: String,

    /// Local adapter address for RFCOMM
    pub bluetooth_address: String,

    pub bluetooth_channel: u8,

    #[serde(default)]
    pub transports: EnabledTransports,

    /// Capacity of each connection's write queue
    pub backpressure_limit: usize,

    /// Inactivity grace period; also bounds the key exchange
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// Default deadline for requests issued from the server side
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// How long `shutdown` waits for connections to drain
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,

    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".into(),
            udp_address: "127.0.0.1:9001".into(),
            bluetooth_address: "00:00:00:00:00:00".into(),
            bluetooth_channel: 1,
            transports: EnabledTransports::default(),
            backpressure_limit: 128,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            request_timeout: timeout::REQUEST_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut p = Problems::default();

        p.require(
            self.transports.any(),
            "At least one transport (tcp, udp, bluetooth) must be enabled",
        );
        if self.transports.tcp {
            p.socket_addr("server", &self.address);
        }
        if self.transports.udp {
            p.socket_addr("udp", &self.udp_address);
        }
        if self.transports.bluetooth {
            p.bluetooth_addr("server", &self.bluetooth_address);
            p.bluetooth_compiled_in();
        }

        p.count("Backpressure limit", self.backpressure_limit, 1_000_000);
        p.count("Max connections", self.max_connections, 100_000);
        p.liveness(self.heartbeat_interval, self.connection_timeout);
        p.duration(
            "Request timeout",
            self.request_timeout,
            Duration::from_millis(10),
            None,
        );
        p.duration(
            "Shutdown timeout",
            self.shutdown_timeout,
            Duration::from_secs(1),
            Some(Duration::from_secs(60)),
        );
        p.0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// `host:port` for TCP/UDP, `AA:BB:CC:DD:EE:FF` for Bluetooth
    pub address: String,

    pub transport: TransportKind,

    /// RFCOMM channel when `transport` is Bluetooth
    pub bluetooth_channel: u8,

    /// Bounds connecting and the key exchange; also the inactivity grace period
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Default request deadline
    #[serde(with = "millis")]
    pub response_timeout: Duration,

    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    pub auto_reconnect: bool,

    /// Attempts per outage before giving up; 0 means unlimited
    pub max_reconnect_attempts: u32,

    /// First backoff delay
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,

    /// Backoff cap
    #[serde(with = "millis")]
    pub max_reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".into(),
            transport: TransportKind::Tcp,
            bluetooth_channel: 1,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::REQUEST_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            auto_reconnect: true,
            max_reconnect_attempts: 0,
            reconnect_delay: Duration::from_millis(250),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut p = Problems::default();

        match self.transport {
            TransportKind::Tcp | TransportKind::Udp => p.socket_addr("client", &self.address),
            TransportKind::Bluetooth => {
                p.bluetooth_addr("client", &self.address);
                p.bluetooth_compiled_in();
            }
        }

        p.liveness(self.heartbeat_interval, self.connection_timeout);
        p.duration(
            "Response timeout",
            self.response_timeout,
            Duration::from_millis(10),
            None,
        );
        p.duration(
            "Reconnect delay",
            self.reconnect_delay,
            Duration::from_millis(10),
            Some(Duration::from_secs(60)),
        );
        p.require(
            self.max_reconnect_delay >= self.reconnect_delay,
            "Max reconnect delay cannot be shorter than the reconnect delay",
        );
        p.0
    }
}

/// Frame transforms and type negotiation, shared by both sides
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Run the key exchange and encrypt every application frame
    pub encryption_enabled: bool,

    /// Attach an Ed25519 signature to secured frames
    pub sign_frames: bool,

    pub max_payload_size: usize,

    pub compression_enabled: bool,

    pub compression_kind: CompressionKind,

    /// Payloads smaller than this are never compressed
    #[serde(default)]
    pub compression_threshold_bytes: usize,

    /// Register types announced by the peer even when no local type has that name
    pub accept_unknown_types: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: ENABLE_ENCRYPTION,
            sign_frames: true,
            max_payload_size: MAX_PAYLOAD_SIZE,
            compression_enabled: ENABLE_COMPRESSION,
            compression_kind: CompressionKind::Lz4,
            compression_threshold_bytes: 512,
            accept_unknown_types: false,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut p = Problems::default();

        const MIN_PAYLOAD: usize = 1024;
        const MAX_PAYLOAD: usize = 100 * 1024 * 1024;
        match self.max_payload_size {
            0 => p.0.push("Max payload size cannot be 0".into()),
            n if n < MIN_PAYLOAD => p.0.push("Max payload size too small (minimum: 1 KB)".into()),
            n if n > MAX_PAYLOAD => {
                p.0.push(format!("Max payload size too large: {n} bytes (maximum: 100 MB)"))
            }
            _ => {}
        }

        p.require(
            !self.compression_enabled || self.compression_threshold_bytes <= self.max_payload_size,
            "Compression threshold cannot be larger than max payload size",
        );
        p.require(
            !self.sign_frames || self.encryption_enabled,
            "Frame signing requires the secure channel to be enabled",
        );
        p.0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Reported once when logging starts
    pub app_name: String,

    /// Default filter; `RUST_LOG` takes precedence
    #[serde(with = "level")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Required when `log_to_file` is set; appended to
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: "packet-link".into(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut p = Problems::default();

        p.require(!self.app_name.is_empty(), "Application name cannot be empty");
        p.require(
            self.app_name.len() <= 64,
            format!("Application name too long: {} characters (maximum: 64)", self.app_name.len()),
        );

        if self.log_to_file {
            match self.log_file_path.as_deref().map(Path::new) {
                None => p.0.push("log_file_path must be specified when log_to_file is true".into()),
                Some(path) => {
                    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                        p.require(
                            dir.exists(),
                            format!("Log file directory does not exist: {}", dir.display()),
                        );
                    }
                }
            }
        }

        p.require(
            self.log_to_console || self.log_to_file,
            "At least one logging output (console or file) must be enabled",
        );
        p.0
    }
}

/// `Duration` as integer milliseconds
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

/// `tracing::Level` as its lowercase name
mod level {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level '{name}'")))
    }
}
