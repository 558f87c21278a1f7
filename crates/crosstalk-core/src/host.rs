//! Interfaces to the host application.
//!
//! The broker does not know what the payloads mean, who the clients are, or
//! how the proxy relays bytes. The host supplies those through these traits.

use async_trait::async_trait;
use bytes::Bytes;
use crosstalk_protocol::RosterEntry;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Receives payloads sent by other servers.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    /// Called once per delivered payload, on its own task.
    ///
    /// `sender` is the originating server when the transport knows it.
    async fn on_message_received(&self, channel_id: &str, sender: Option<&str>, payload: Bytes);
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The client can no longer carry messages.
    #[error("Client disconnected: {0}")]
    ClientGone(String),

    /// The relay channel could not be registered.
    #[error("Channel registration failed: {0}")]
    Registration(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A client connected to this server.
pub trait LocalClient: Send + Sync {
    /// Stable client identifier.
    fn id(&self) -> &str;

    /// Display name announced to peers.
    fn name(&self) -> &str {
        self.id()
    }

    /// Hand bytes to the proxy through this client's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot relay.
    fn relay(&self, channel: &str, payload: Bytes) -> Result<(), RelayError>;
}

/// Live view of the clients connected to this server.
pub trait RosterSource: Send + Sync {
    /// Snapshot of the connected clients.
    fn clients(&self) -> Vec<Arc<dyn LocalClient>>;

    /// Snapshot as roster entries for presence announcements.
    fn entries(&self) -> Vec<RosterEntry> {
        self.clients()
            .iter()
            .map(|client| RosterEntry::new(client.id(), client.name()))
            .collect()
    }
}

/// The proxy's plugin-channel mechanism.
pub trait RelayMessenger: Send + Sync {
    /// Allow sending on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    fn register_outgoing(&self, channel: &str) -> Result<(), RelayError>;

    /// Deliver bytes arriving on `channel` to `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    fn register_incoming(
        &self,
        channel: &str,
        handler: Arc<dyn PayloadHandler>,
    ) -> Result<(), RelayError>;

    /// Stop sending on `channel`.
    fn unregister_outgoing(&self, channel: &str);

    /// Stop receiving on `channel`.
    fn unregister_incoming(&self, channel: &str);
}

/// A thread-safe roster maintained by the host.
#[derive(Default)]
pub struct StaticRoster {
    clients: RwLock<Vec<Arc<dyn LocalClient>>>,
}

impl StaticRoster {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client, replacing any client with the same id.
    pub fn add(&self, client: Arc<dyn LocalClient>) {
        let mut clients = self.clients.write();
        clients.retain(|existing| existing.id() != client.id());
        clients.push(client);
    }

    /// Remove a client.
    ///
    /// Returns `true` if the client was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|client| client.id() != id);
        clients.len() != before
    }

    /// Get the number of clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Check if the roster is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl RosterSource for StaticRoster {
    fn clients(&self) -> Vec<Arc<dyn LocalClient>> {
        self.clients.read().clone()
    }
}

/// A client known by id and name only, with no relay conduit.
///
/// Useful on the bus transport, where clients are announced but never used
/// to carry bytes.
#[derive(Debug, Clone)]
pub struct NamedClient {
    id: String,
    name: String,
}

impl NamedClient {
    /// Create a named client.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl LocalClient for NamedClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn relay(&self, _channel: &str, _payload: Bytes) -> Result<(), RelayError> {
        Err(RelayError::Other(format!(
            "client {} has no relay conduit",
            self.id
        )))
    }
}
