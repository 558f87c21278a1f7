//! Broker configuration.
//!
//! A [`BrokerConfig`] is built once at startup, validated, and never mutated
//! afterwards; brokers keep it behind an `Arc`.

use crosstalk_protocol::{validate_sender_id, EnvelopeError};
use crosstalk_transport::PoolConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::{BackoffPolicy, FixedBackoff, JitteredBackoff};

/// Prefix of every bus channel name.
pub const CHANNEL_PREFIX: &str = "crosstalk:";

/// Relay channel name; also the channel id reported to payload handlers.
pub const RELAY_CHANNEL: &str = "crosstalk:main";

/// Maximum channel suffix length.
pub const MAX_CHANNEL_SUFFIX_LENGTH: usize = 200;

/// Scheduler tick used to express presence timings.
pub const TICK: Duration = Duration::from_millis(50);

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Convert scheduler ticks to a duration.
#[must_use]
pub const fn ticks(n: u32) -> Duration {
    Duration::from_millis(TICK.as_millis() as u64 * n as u64)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The server name cannot be used as an envelope sender.
    #[error("Invalid server name: {0}")]
    ServerName(#[from] EnvelopeError),

    /// Bus transport without a bus URL.
    #[error("Bus transport requires a bus URL")]
    MissingBusUrl,

    /// Invalid channel suffix.
    #[error("Invalid channel suffix: {0}")]
    ChannelSuffix(&'static str),

    /// Presence interval of zero.
    #[error("Presence interval must be non-zero")]
    ZeroPresenceInterval,

    /// Pool that can never hand out a connection.
    #[error("Connection pool must allow at least one connection")]
    EmptyPool,
}

/// Which transport carries messages between servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Relay through the proxy layer's plugin channel.
    Relay,
    /// Direct publish/subscribe over a shared bus.
    Bus,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Bus => write!(f, "bus"),
        }
    }
}

/// Presence broadcast timings.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Delay before the first broadcast after start.
    pub initial_delay: Duration,
    /// Period between broadcasts.
    pub interval: Duration,
    /// Remote rosters older than this are discarded on read.
    pub roster_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            initial_delay: ticks(20),
            interval: ticks(40),
            roster_ttl: Duration::from_millis(5000),
        }
    }
}

/// Validate a channel suffix.
///
/// # Errors
///
/// Returns an error message if the suffix is invalid.
pub fn validate_channel_suffix(suffix: &str) -> Result<(), &'static str> {
    if suffix.is_empty() {
        return Err("Channel suffix cannot be empty");
    }
    if suffix.len() > MAX_CHANNEL_SUFFIX_LENGTH {
        return Err("Channel suffix too long");
    }
    if !suffix
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ')
    {
        return Err("Channel suffix contains invalid characters");
    }
    Ok(())
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    kind: TransportKind,
    server_name: String,
    bus_url: Option<String>,
    channel_suffix: String,
    presence: PresenceConfig,
    pool: PoolConfig,
    reconnect_backoff: Duration,
    reconnect_jitter: Duration,
}

impl BrokerConfig {
    /// Configuration for the bus transport.
    #[must_use]
    pub fn bus(
        server_name: impl Into<String>,
        bus_url: impl Into<String>,
        channel_suffix: impl Into<String>,
    ) -> Self {
        Self {
            kind: TransportKind::Bus,
            server_name: server_name.into(),
            bus_url: Some(bus_url.into()),
            channel_suffix: channel_suffix.into(),
            presence: PresenceConfig::default(),
            pool: PoolConfig::default(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            reconnect_jitter: Duration::ZERO,
        }
    }

    /// Configuration for the relay transport.
    #[must_use]
    pub fn relay(server_name: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Relay,
            server_name: server_name.into(),
            bus_url: None,
            channel_suffix: "main".to_string(),
            presence: PresenceConfig::default(),
            pool: PoolConfig::default(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            reconnect_jitter: Duration::ZERO,
        }
    }

    /// Override presence timings.
    #[must_use]
    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    /// Override pool limits.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Override the reconnect backoff. A non-zero jitter spreads reconnects
    /// of many servers over `[backoff, backoff + jitter]`.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, backoff: Duration, jitter: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self.reconnect_jitter = jitter;
        self
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_sender_id(&self.server_name)?;
        validate_channel_suffix(&self.channel_suffix).map_err(ConfigError::ChannelSuffix)?;

        if self.kind == TransportKind::Bus {
            match self.bus_url.as_deref() {
                Some(url) if !url.trim().is_empty() => {}
                _ => return Err(ConfigError::MissingBusUrl),
            }
            if self.presence.interval.is_zero() {
                return Err(ConfigError::ZeroPresenceInterval);
            }
            if self.pool.max_total == 0 {
                return Err(ConfigError::EmptyPool);
            }
        }
        Ok(())
    }

    /// Get the transport kind.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Get the local process identifier.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Get the bus URL, if any.
    #[must_use]
    pub fn bus_url(&self) -> Option<&str> {
        self.bus_url.as_deref()
    }

    /// Get the channel suffix.
    #[must_use]
    pub fn channel_suffix(&self) -> &str {
        &self.channel_suffix
    }

    /// Get the full bus channel name.
    #[must_use]
    pub fn channel_name(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.channel_suffix)
    }

    /// Get the presence timings.
    #[must_use]
    pub fn presence(&self) -> &PresenceConfig {
        &self.presence
    }

    /// Get the pool limits.
    #[must_use]
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Build the reconnect backoff policy.
    #[must_use]
    pub fn backoff_policy(&self) -> Arc<dyn BackoffPolicy> {
        if self.reconnect_jitter.is_zero() {
            Arc::new(FixedBackoff::new(self.reconnect_backoff))
        } else {
            Arc::new(JitteredBackoff::new(
                self.reconnect_backoff,
                self.reconnect_jitter,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks() {
        assert_eq!(ticks(20), Duration::from_secs(1));
        assert_eq!(ticks(40), Duration::from_secs(2));
    }

    #[test]
    fn test_channel_name() {
        let config = BrokerConfig::bus("lobby", "redis://localhost:6379", "network-a");
        assert_eq!(config.channel_name(), "crosstalk:network-a");
    }

    #[test]
    fn test_validate_bus_config() {
        assert!(BrokerConfig::bus("lobby", "redis://localhost", "main")
            .validate()
            .is_ok());
        assert!(matches!(
            BrokerConfig::bus("lobby", " ", "main").validate(),
            Err(ConfigError::MissingBusUrl)
        ));
        assert!(matches!(
            BrokerConfig::bus("", "redis://localhost", "main").validate(),
            Err(ConfigError::ServerName(_))
        ));
        assert!(matches!(
            BrokerConfig::bus("lob|by", "redis://localhost", "main").validate(),
            Err(ConfigError::ServerName(_))
        ));
        assert!(matches!(
            BrokerConfig::bus("lobby", "redis://localhost", "").validate(),
            Err(ConfigError::ChannelSuffix(_))
        ));
    }

    #[test]
    fn test_validate_relay_config() {
        let config = BrokerConfig::relay("lobby");
        assert!(config.validate().is_ok());
        assert_eq!(config.kind(), TransportKind::Relay);
        assert!(config.bus_url().is_none());
    }

    #[test]
    fn test_zero_presence_interval_rejected() {
        let config = BrokerConfig::bus("lobby", "redis://localhost", "main").with_presence(
            PresenceConfig {
                interval: Duration::ZERO,
                ..Default::default()
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroPresenceInterval)
        ));
    }

    #[test]
    fn test_backoff_policy_selection() {
        let fixed = BrokerConfig::bus("lobby", "redis://localhost", "main");
        assert_eq!(fixed.backoff_policy().next_delay(3), DEFAULT_RECONNECT_BACKOFF);

        let jittered = fixed.with_reconnect_backoff(Duration::from_secs(1), Duration::from_secs(1));
        let delay = jittered.backoff_policy().next_delay(1);
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(2));
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Relay.to_string(), "relay");
        assert_eq!(TransportKind::Bus.to_string(), "bus");
    }
}
