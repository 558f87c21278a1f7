//! The broker facade.
//!
//! Both transports implement [`Broker`]; the host picks one at startup with
//! [`build_broker`](crate::build_broker) and talks only to the trait.

use async_trait::async_trait;
use bytes::Bytes;
use crosstalk_protocol::EnvelopeError;
use crosstalk_transport::TransportError;
use thiserror::Error;

use crate::config::{ConfigError, TransportKind};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// No peer or bus to send through right now. The caller may retry.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The bus connection dropped mid-stream.
    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] TransportError),

    /// A received message could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(#[from] EnvelopeError),

    /// The transport could not be set up at start.
    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] TransportError),
}

impl BrokerError {
    /// Check whether a later retry of the same call can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::TransportUnavailable(_) | BrokerError::ConnectionLost(_)
        )
    }
}

/// A cross-process message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start the broker.
    ///
    /// Returns `Ok` immediately if already started. On error the broker
    /// stays stopped.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Stop the broker and release its resources.
    ///
    /// Safe to call repeatedly, before `start`, and from any task.
    async fn stop(&self);

    /// Send an opaque payload to the other servers.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportUnavailable`] when there is nothing to
    /// send through.
    async fn send_data(&self, payload: Bytes) -> Result<(), BrokerError>;

    /// Check whether the broker can currently reach peers.
    fn is_connected(&self) -> bool;

    /// Check whether the broker is started.
    fn is_started(&self) -> bool;

    /// Get the transport kind.
    fn kind(&self) -> TransportKind;

    /// Get the local process identifier.
    fn server_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(BrokerError::TransportUnavailable("no peers".into()).is_transient());
        assert!(BrokerError::ConnectionLost(TransportError::ConnectionClosed).is_transient());
        assert!(!BrokerError::Provisioning(TransportError::Timeout).is_transient());
        assert!(!BrokerError::Malformed(EnvelopeError::MissingSeparator).is_transient());
    }
}
