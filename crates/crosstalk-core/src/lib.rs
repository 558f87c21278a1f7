//! # crosstalk-core
//!
//! Cross-process message broker for Crosstalk.
//!
//! Independent server processes exchange opaque payloads through one of two
//! transports hidden behind the [`Broker`] trait:
//!
//! - **Relay** - payloads ride on a local client connection through the proxy
//! - **Bus** - payloads are published to a shared pub/sub channel
//!
//! ## Architecture
//!
//! ```text
//!               send_data                      publish
//! ┌──────────┐ ──────────▶ ┌─────────────┐ ──────────▶ ┌─────────┐
//! │   Host   │             │  BusBroker  │             │   Bus   │
//! └──────────┘ ◀────────── └─────────────┘ ◀────────── └─────────┘
//!   handler      dispatch   subscriber loop   messages
//!                           presence ticks
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use crosstalk_core::{build_broker, BrokerConfig, BrokerDeps};
//!
//! let config = BrokerConfig::bus("lobby", "redis://127.0.0.1:6379", "main");
//! let broker = build_broker(config, BrokerDeps::new(handler, roster))?;
//! broker.start().await?;
//! broker.send_data(bytes::Bytes::from_static(b"hello")).await?;
//! ```

pub mod backoff;
pub mod broker;
pub mod bus;
pub mod config;
pub mod host;
pub mod presence;
pub mod publisher;
pub mod relay;
pub mod state;
pub mod subscriber;

pub use backoff::{BackoffPolicy, FixedBackoff, JitteredBackoff};
pub use broker::{Broker, BrokerError};
pub use bus::BusBroker;
pub use config::{
    BrokerConfig, ConfigError, PresenceConfig, TransportKind, CHANNEL_PREFIX, RELAY_CHANNEL,
};
pub use host::{
    LocalClient, NamedClient, PayloadHandler, RelayError, RelayMessenger, RosterSource,
    StaticRoster,
};
pub use presence::{PeerRoster, PresenceTracker, RemoteRoster};
pub use relay::RelayBroker;
pub use state::BrokerState;
pub use subscriber::SubscriberState;

pub use crosstalk_protocol::RosterEntry;

use crosstalk_transport::BusConnector;
use std::sync::Arc;

/// Host collaborators handed to a broker at construction.
#[derive(Clone)]
pub struct BrokerDeps {
    /// Receives payloads from other servers.
    pub handler: Arc<dyn PayloadHandler>,
    /// Local clients, announced by presence and used as relay conduits.
    pub roster: Arc<dyn RosterSource>,
    /// Proxy channel mechanism, required by the relay transport.
    pub relay: Option<Arc<dyn RelayMessenger>>,
    /// Bus connector. When absent the bus transport connects to the
    /// configured URL with Redis.
    pub connector: Option<Arc<dyn BusConnector>>,
    /// Roster the bus transport records peer presence in. When absent the
    /// broker keeps a private one.
    pub peers: Option<Arc<RemoteRoster>>,
}

impl BrokerDeps {
    /// Create dependencies with no relay messenger and the default connector.
    #[must_use]
    pub fn new(handler: Arc<dyn PayloadHandler>, roster: Arc<dyn RosterSource>) -> Self {
        Self {
            handler,
            roster,
            relay: None,
            connector: None,
            peers: None,
        }
    }

    /// Set the relay messenger.
    #[must_use]
    pub fn with_relay(mut self, relay: Arc<dyn RelayMessenger>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Share a peer roster with the bus transport.
    #[must_use]
    pub fn with_peer_roster(mut self, peers: Arc<RemoteRoster>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Set the bus connector.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn BusConnector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// Build the broker selected by `config.kind()`.
///
/// The broker is returned stopped.
///
/// # Errors
///
/// Returns [`BrokerError::Config`] if the configuration is invalid, or
/// [`BrokerError::Provisioning`] if a required collaborator is missing or
/// the bus URL cannot be parsed.
pub fn build_broker(config: BrokerConfig, deps: BrokerDeps) -> Result<Arc<dyn Broker>, BrokerError> {
    config.validate()?;

    match config.kind() {
        TransportKind::Relay => {
            let messenger = deps.relay.ok_or_else(|| {
                BrokerError::Provisioning(crosstalk_transport::TransportError::Other(
                    "relay transport requires a relay messenger".to_string(),
                ))
            })?;
            Ok(Arc::new(RelayBroker::new(
                config.server_name(),
                messenger,
                deps.roster,
                deps.handler,
            )))
        }
        TransportKind::Bus => {
            let connector = match deps.connector {
                Some(connector) => connector,
                None => default_connector(&config)?,
            };
            let mut broker =
                BusBroker::new(Arc::new(config), connector, deps.handler, deps.roster);
            if let Some(peers) = deps.peers {
                broker = broker.with_peer_roster(peers);
            }
            Ok(Arc::new(broker))
        }
    }
}

#[cfg(feature = "redis")]
fn default_connector(config: &BrokerConfig) -> Result<Arc<dyn BusConnector>, BrokerError> {
    let url = config.bus_url().ok_or(ConfigError::MissingBusUrl)?;
    let connector =
        crosstalk_transport::RedisConnector::open(url).map_err(BrokerError::Provisioning)?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "redis"))]
fn default_connector(_config: &BrokerConfig) -> Result<Arc<dyn BusConnector>, BrokerError> {
    Err(BrokerError::Provisioning(
        crosstalk_transport::TransportError::Other(
            "no bus connector given and the redis feature is disabled".to_string(),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crosstalk_transport::MemoryBus;

    struct Ignore;

    #[async_trait::async_trait]
    impl PayloadHandler for Ignore {
        async fn on_message_received(&self, _: &str, _: Option<&str>, _: Bytes) {}
    }

    fn deps() -> BrokerDeps {
        BrokerDeps::new(Arc::new(Ignore), Arc::new(StaticRoster::new()))
    }

    #[test]
    fn test_build_bus_broker() {
        let config = BrokerConfig::bus("lobby", "memory://", "main");
        let broker = build_broker(config, deps().with_connector(Arc::new(MemoryBus::new()))).unwrap();
        assert_eq!(broker.kind(), TransportKind::Bus);
        assert_eq!(broker.server_name(), "lobby");
        assert!(!broker.is_started());
    }

    #[test]
    fn test_relay_requires_messenger() {
        let result = build_broker(BrokerConfig::relay("lobby"), deps());
        assert!(matches!(result, Err(BrokerError::Provisioning(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = build_broker(BrokerConfig::relay("lob|by"), deps());
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }
}
