//! Broker configuration.
//!
//! Configuration is loaded in three layers:
//! 1. compiled defaults ([`BrokerConfig::default`]),
//! 2. a JSON document, in which every field is optional,
//! 3. `WSBROKER_HOST` / `WSBROKER_PORT` environment overrides.
//!
//! Durations are written as (fractional) seconds.
//!
//! ```
//! use std::time::Duration;
//! use wsbroker::BrokerConfig;
//!
//! let config = BrokerConfig::from_json_str(
//!     r#"{ "server": { "port": 9000, "keepalive_ping": true, "keepalive_interval": 2.5 } }"#,
//! )
//! .unwrap();
//! assert_eq!(config.server.port, 9000);
//! assert_eq!(config.server.keepalive_interval, Duration::from_millis(2500));
//! assert_eq!(config.client.storage.ttl, Duration::from_secs(900));
//! ```

use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

/// Environment variable overriding [`ServerConfig::host`].
pub const HOST_ENV: &str = "WSBROKER_HOST";
/// Environment variable overriding [`ServerConfig::port`].
pub const PORT_ENV: &str = "WSBROKER_PORT";

/// The longest interval, timeout or TTL accepted anywhere in the
/// configuration: one year.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Errors produced when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid JSON, or has the wrong shape.
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// (De)serialize a [`Duration`] as fractional seconds.
mod secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener and event loop settings.
    pub server: ServerConfig,
    /// Client session settings.
    pub client: ClientConfig,
    /// Allowed WebSocket origins.
    pub origins: Vec<String>,
    /// Health check settings.
    pub ping: PingConfig,
    /// Pusher settings.
    pub pushers: PushersConfig,
}

/// Listener and event loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Reject handshakes whose origin is not on the allow-list.
    pub origin_check: bool,
    /// Ping every connection periodically.
    pub keepalive_ping: bool,
    /// Interval between keepalive pings.
    #[serde(with = "secs")]
    pub keepalive_interval: Duration,
    /// Event loop tick, which drives periodic tasks and storage sweeps.
    #[serde(with = "secs")]
    pub tick_interval: Duration,
    /// Report connection and topic counts periodically.
    pub stats_report: bool,
    /// Interval between stats reports.
    #[serde(with = "secs")]
    pub stats_interval: Duration,
    /// Maximum time for a client to complete the WebSocket handshake.
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,
    /// Maximum run time of an RPC handler.
    #[serde(with = "secs")]
    pub rpc_timeout: Duration,
    /// Per-connection outbound buffer, in frames.
    pub outbound_buffer: usize,
    /// Event loop command queue capacity.
    pub command_buffer: usize,
    /// Bearer token identifying the trusted pusher peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_token: Option<String>,
    /// Server identification sent in `WELCOME`.
    pub server_ident: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            origin_check: false,
            keepalive_ping: false,
            keepalive_interval: Duration::from_secs(30),
            tick_interval: Duration::from_millis(100),
            stats_report: false,
            stats_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
            command_buffer: 1024,
            peer_token: None,
            server_ident: concat!("wsbroker/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ServerConfig {
    /// The socket address to listen on.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("server.host `{}` is not an IP address", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Client session settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Session storage settings.
    pub storage: StorageConfig,
}

/// Session storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Session record lifetime, refreshed by client activity.
    #[serde(with = "secs")]
    pub ttl: Duration,
    /// Prefix of every session key.
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(900),
            prefix: String::new(),
        }
    }
}

/// Health check settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Probes to run. Each name must match a probe registered on the
    /// broker builder.
    pub services: Vec<PingService>,
}

/// One periodically probed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingService {
    /// Name of the registered probe.
    pub name: String,
    /// Interval between probes.
    #[serde(with = "secs", default = "PingService::default_interval")]
    pub interval: Duration,
    /// Consecutive failures before the service is reported unhealthy.
    #[serde(default = "PingService::default_threshold")]
    pub failure_threshold: u32,
}

impl PingService {
    const fn default_interval() -> Duration {
        Duration::from_secs(20)
    }

    const fn default_threshold() -> u32 {
        3
    }
}

/// Pusher settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushersConfig {
    /// The privileged-peer pusher. Disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerPusherConfig>,
}

/// Settings of the privileged-peer pusher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPusherConfig {
    /// WebSocket URL of the broker, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// `Origin` header to present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Bearer token to present. Should match `server.peer_token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Messages buffered while the link is down.
    pub buffer: usize,
    /// First reconnect delay.
    #[serde(with = "secs")]
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    #[serde(with = "secs")]
    pub backoff_max: Duration,
}

impl Default for PeerPusherConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            origin: None,
            token: None,
            buffer: 256,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Parse a JSON document over the defaults, and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file, apply environment overrides, and validate.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)?;
        config.apply_env()?;
        config.validate()?;
        tracing::debug!(?path, "configuration loaded");
        Ok(config)
    }

    /// Apply `WSBROKER_HOST` / `WSBROKER_PORT` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply host and port overrides from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup(HOST_ENV).filter(|host| !host.is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = lookup(PORT_ENV).filter(|port| !port.is_empty()) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{PORT_ENV} `{port}` is not a port")))?;
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let server = &self.server;

        server.socket_addr()?;
        for (name, value) in [
            ("server.keepalive_interval", server.keepalive_interval),
            ("server.tick_interval", server.tick_interval),
            ("server.stats_interval", server.stats_interval),
            ("server.handshake_timeout", server.handshake_timeout),
            ("server.rpc_timeout", server.rpc_timeout),
            ("client.storage.ttl", self.client.storage.ttl),
        ] {
            in_range(name, value)?;
        }
        if server.keepalive_ping && server.keepalive_interval.is_zero() {
            return invalid("server.keepalive_interval must be positive");
        }
        if server.stats_report && server.stats_interval.is_zero() {
            return invalid("server.stats_interval must be positive");
        }
        if server.tick_interval.is_zero() {
            return invalid("server.tick_interval must be positive");
        }
        if server.handshake_timeout.is_zero() {
            return invalid("server.handshake_timeout must be positive");
        }
        if server.rpc_timeout.is_zero() {
            return invalid("server.rpc_timeout must be positive");
        }
        if server.outbound_buffer == 0 || server.command_buffer == 0 {
            return invalid("server buffers must hold at least one message");
        }
        if self.origins.iter().any(|origin| origin.is_empty()) {
            return invalid("origins must not be empty strings");
        }
        for service in &self.ping.services {
            if service.name.is_empty() {
                return invalid("ping.services[].name must not be empty");
            }
            if service.interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "ping service `{}` must have a positive interval",
                    service.name
                )));
            }
            in_range("ping.services[].interval", service.interval)?;
        }
        if let Some(peer) = &self.pushers.peer {
            if peer.url.is_empty() {
                return invalid("pushers.peer.url must not be empty");
            }
            if peer.buffer == 0 {
                return invalid("pushers.peer.buffer must hold at least one message");
            }
            if peer.backoff_base.is_zero() || peer.backoff_base > peer.backoff_max {
                return invalid("pushers.peer backoff must satisfy 0 < base <= max");
            }
            in_range("pushers.peer.backoff_max", peer.backoff_max)?;
        }
        Ok(())
    }
}

/// Reject durations above [`MAX_DURATION`].
fn in_range(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_DURATION {
        return Err(ConfigError::Invalid(format!(
            "{name} must be at most {} seconds",
            MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}
