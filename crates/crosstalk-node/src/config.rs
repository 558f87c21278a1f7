//! Node configuration.
//!
//! Configuration is layered, later sources winning:
//! - `crosstalk.toml` in the working directory, then `/etc/crosstalk/` and
//!   `~/.config/crosstalk/` (or the file given with `--config`)
//! - Environment variables (`CROSSTALK__BROKER__SERVER_NAME=lobby`)

use anyhow::{Context, Result};
use crosstalk_core::{BrokerConfig, PresenceConfig, TransportKind};
use crosstalk_transport::PoolConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Files probed when no `--config` is given.
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "crosstalk.toml",
    "/etc/crosstalk/crosstalk.toml",
    "~/.config/crosstalk/crosstalk.toml",
];

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "CROSSTALK";

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker settings.
    #[serde(default)]
    pub broker: BrokerSection,

    /// Presence timings.
    #[serde(default)]
    pub presence: PresenceSection,

    /// Publishing connection pool limits.
    #[serde(default)]
    pub pool: PoolSection,

    /// HTTP status endpoint.
    #[serde(default)]
    pub http: HttpConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Clients this node announces as connected.
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Transport kind.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Unique name of this node.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Bus URL. `memory://` runs a private in-process bus: loopback only,
    /// no other process can join it, so no peers are ever seen.
    #[serde(default = "default_bus_url")]
    pub bus_url: Option<String>,

    /// Channel suffix; nodes only hear each other on the same suffix.
    #[serde(default = "default_channel_suffix")]
    pub channel_suffix: String,

    /// Delay between reconnect attempts in milliseconds.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Random extra reconnect delay in milliseconds.
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
}

/// Presence timings in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Delay before the first announcement.
    #[serde(default = "default_presence_initial_delay")]
    pub initial_delay_ms: u64,

    /// Period between announcements.
    #[serde(default = "default_presence_interval")]
    pub interval_ms: u64,

    /// Peer rosters older than this are forgotten.
    #[serde(default = "default_presence_ttl")]
    pub ttl_ms: u64,
}

/// Pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Maximum live connections.
    #[serde(default = "default_pool_max_total")]
    pub max_total: usize,

    /// Maximum idle connections.
    #[serde(default = "default_pool_max_idle")]
    pub max_idle: usize,

    /// Connections opened at start.
    #[serde(default = "default_pool_min_idle")]
    pub min_idle: usize,

    /// Longest wait for a free connection.
    #[serde(default = "default_pool_max_wait")]
    pub max_wait_ms: u64,

    /// Idle connections older than this are closed.
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_ms: u64,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Serve `/health` and `/status`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A statically configured local client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Client id.
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_transport() -> TransportKind {
    TransportKind::Bus
}

fn default_server_name() -> String {
    "crosstalk-node".to_string()
}

fn default_bus_url() -> Option<String> {
    Some("redis://127.0.0.1:6379".to_string())
}

fn default_channel_suffix() -> String {
    "main".to_string()
}

fn default_reconnect_backoff() -> u64 {
    5_000
}

fn default_presence_initial_delay() -> u64 {
    1_000 // 20 ticks
}

fn default_presence_interval() -> u64 {
    2_000 // 40 ticks
}

fn default_presence_ttl() -> u64 {
    5_000
}

fn default_pool_max_total() -> usize {
    10
}

fn default_pool_max_idle() -> usize {
    5
}

fn default_pool_min_idle() -> usize {
    2
}

fn default_pool_max_wait() -> u64 {
    100
}

fn default_pool_idle_timeout() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            server_name: default_server_name(),
            bus_url: default_bus_url(),
            channel_suffix: default_channel_suffix(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            reconnect_jitter_ms: 0,
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_presence_initial_delay(),
            interval_ms: default_presence_interval(),
            ttl_ms: default_presence_ttl(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_total: default_pool_max_total(),
            max_idle: default_pool_max_idle(),
            min_idle: default_pool_min_idle(),
            max_wait_ms: default_pool_max_wait(),
            idle_timeout_ms: default_pool_idle_timeout(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from files and the environment.
    ///
    /// With `path` set, that file must exist; otherwise the default
    /// locations are probed and missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed or a value has the wrong
    /// type.
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Environment, File, FileFormat};

        let mut builder = ::config::Config::builder();
        match path {
            Some(path) => {
                let expanded = shellexpand::tilde(path);
                builder = builder
                    .add_source(File::new(expanded.as_ref(), FileFormat::Toml).required(true));
            }
            None => {
                for candidate in DEFAULT_CONFIG_PATHS {
                    let expanded = shellexpand::tilde(candidate);
                    builder = builder
                        .add_source(File::new(expanded.as_ref(), FileFormat::Toml).required(false));
                }
            }
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Build the broker configuration.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        let broker = &self.broker;
        let config = match broker.transport {
            TransportKind::Bus => BrokerConfig::bus(
                broker.server_name.as_str(),
                broker.bus_url.clone().unwrap_or_default(),
                broker.channel_suffix.as_str(),
            ),
            TransportKind::Relay => BrokerConfig::relay(broker.server_name.as_str()),
        };

        config
            .with_presence(PresenceConfig {
                initial_delay: Duration::from_millis(self.presence.initial_delay_ms),
                interval: Duration::from_millis(self.presence.interval_ms),
                roster_ttl: Duration::from_millis(self.presence.ttl_ms),
            })
            .with_pool(PoolConfig {
                max_total: self.pool.max_total,
                max_idle: self.pool.max_idle,
                min_idle: self.pool.min_idle,
                max_wait: Duration::from_millis(self.pool.max_wait_ms),
                idle_timeout: Duration::from_millis(self.pool.idle_timeout_ms),
            })
            .with_reconnect_backoff(
                Duration::from_millis(broker.reconnect_backoff_ms),
                Duration::from_millis(broker.reconnect_jitter_ms),
            )
    }

    /// Check whether the bus URL selects the in-process bus.
    #[must_use]
    pub fn uses_memory_bus(&self) -> bool {
        self.broker
            .bus_url
            .as_deref()
            .is_some_and(|url| url.starts_with("memory://"))
    }

    /// Get the HTTP socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.http.host, self.http.port)
            .parse()
            .with_context(|| format!("Invalid HTTP address {}:{}", self.http.host, self.http.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.transport, TransportKind::Bus);
        assert_eq!(config.http.port, 8080);
        assert!(config.clients.is_empty());
        assert!(!config.uses_memory_bus());

        let broker = config.broker_config();
        assert!(broker.validate().is_ok());
        assert_eq!(broker.channel_name(), "crosstalk:main");
        assert_eq!(broker.presence().interval, Duration::from_secs(2));
        assert_eq!(broker.pool().max_total, 10);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [broker]
            server_name = "lobby"
            bus_url = "memory://"
            channel_suffix = "network-a"
            reconnect_jitter_ms = 250

            [presence]
            interval_ms = 500

            [[clients]]
            id = "7c1e"
            name = "Alex"

            [[clients]]
            id = "9f02"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.server_name, "lobby");
        assert!(config.uses_memory_bus());
        assert_eq!(config.presence.initial_delay_ms, 1_000);
        assert_eq!(config.clients.len(), 2);
        assert!(config.clients[1].name.is_none());

        let broker = config.broker_config();
        assert_eq!(broker.channel_name(), "crosstalk:network-a");
        assert_eq!(broker.presence().interval, Duration::from_millis(500));
    }

    #[test]
    fn test_relay_transport_from_toml() {
        let config: Config = toml::from_str("[broker]\ntransport = \"relay\"").unwrap();
        let broker = config.broker_config();
        assert_eq!(broker.kind(), TransportKind::Relay);
        assert!(broker.validate().is_ok());
    }

    #[test]
    fn test_load_requires_explicit_file() {
        assert!(Config::load(Some("/nonexistent/crosstalk.toml")).is_err());
    }
}
