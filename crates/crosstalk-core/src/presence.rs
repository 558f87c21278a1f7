//! Presence for Crosstalk.
//!
//! Every server periodically announces which clients it hosts. Peers keep
//! the latest announcement per server in a [`RemoteRoster`] and forget it
//! once it goes stale.

use async_trait::async_trait;
use bytes::Bytes;
use crosstalk_protocol::{codec, Frame, RosterEntry};
use dashmap::DashMap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::broker::BrokerError;
use crate::config::PresenceConfig;
use crate::host::{PayloadHandler, RosterSource};
use crate::state::BrokerState;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Where encoded presence frames go.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one encoded frame to the peers.
    async fn send_frame(&self, frame: Bytes) -> Result<(), BrokerError>;
}

/// Encode a frame for the send path.
///
/// # Errors
///
/// Returns [`BrokerError::TransportUnavailable`] if the frame cannot be
/// encoded.
pub fn encode_frame(frame: &Frame) -> Result<Bytes, BrokerError> {
    codec::encode(frame).map_err(|e| BrokerError::TransportUnavailable(e.to_string()))
}

/// Periodic roster announcement.
pub struct PresenceBroadcaster {
    server_name: String,
    roster: Arc<dyn RosterSource>,
    sink: Arc<dyn FrameSink>,
    state: Arc<BrokerState>,
    config: PresenceConfig,
}

impl PresenceBroadcaster {
    /// Create a broadcaster.
    #[must_use]
    pub fn new(
        server_name: impl Into<String>,
        roster: Arc<dyn RosterSource>,
        sink: Arc<dyn FrameSink>,
        state: Arc<BrokerState>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            roster,
            sink,
            state,
            config,
        }
    }

    /// Run one broadcast.
    ///
    /// Returns `Ok(false)` without sending while the broker is not both
    /// started and connected.
    ///
    /// # Errors
    ///
    /// Returns the send error.
    pub async fn tick(&self) -> Result<bool, BrokerError> {
        if !self.state.is_connected() {
            return Ok(false);
        }
        let frame = Frame::presence(&self.server_name, now_millis(), self.roster.entries());
        self.sink.send_frame(encode_frame(&frame)?).await?;
        Ok(true)
    }

    /// Start broadcasting on a background task.
    #[must_use]
    pub fn spawn(self) -> PresenceHandle {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.run(cancel.clone()));
        PresenceHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        let first = Instant::now() + self.config.initial_delay;
        let mut interval = tokio::time::interval_at(first, self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(true)) => trace!(server = %self.server_name, "Presence broadcast sent"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(server = %self.server_name, error = %e, "Presence broadcast failed"),
                Err(_) => debug!(server = %self.server_name, "Presence broadcast panicked"),
            }
        }
        debug!(server = %self.server_name, "Presence broadcaster stopped");
    }
}

/// Handle to a running broadcaster.
pub struct PresenceHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PresenceHandle {
    /// Cancel the broadcaster and wait until no tick is running.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.join).await;
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Roster announced by one peer server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoster {
    /// Announcing server.
    pub server: String,
    /// Peer's timestamp for the announcement.
    pub timestamp: u64,
    /// Clients connected to the peer.
    pub clients: Vec<RosterEntry>,
}

struct StoredRoster {
    roster: PeerRoster,
    received_at: Instant,
}

impl StoredRoster {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.received_at.elapsed() <= ttl
    }
}

/// Latest roster per peer server.
///
/// Entries are stamped with the local receive time and dropped by whichever
/// read finds them older than the TTL.
pub struct RemoteRoster {
    peers: DashMap<String, StoredRoster>,
    ttl: Duration,
}

impl RemoteRoster {
    /// Create an empty roster.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            ttl,
        }
    }

    /// Get the TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a peer's announcement.
    ///
    /// Returns `false` if a newer announcement from the same peer is already
    /// held.
    pub fn record(&self, server: &str, timestamp: u64, clients: Vec<RosterEntry>) -> bool {
        let stored = StoredRoster {
            roster: PeerRoster {
                server: server.to_string(),
                timestamp,
                clients,
            },
            received_at: Instant::now(),
        };

        match self.peers.entry(server.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let current = existing.get();
                if current.is_fresh(self.ttl) && current.roster.timestamp > timestamp {
                    trace!(server, timestamp, "Ignoring out-of-date presence");
                    return false;
                }
                existing.insert(stored);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored);
            }
        }
        true
    }

    /// Get a peer's roster if it is still fresh.
    #[must_use]
    pub fn snapshot(&self, server: &str) -> Option<PeerRoster> {
        match self.peers.get(server) {
            Some(stored) if stored.is_fresh(self.ttl) => return Some(stored.roster.clone()),
            Some(_) => {}
            None => return None,
        }
        self.peers
            .remove_if(server, |_, stored| !stored.is_fresh(self.ttl));
        None
    }

    /// Names of the peers with a fresh roster.
    #[must_use]
    pub fn servers(&self) -> Vec<String> {
        self.purge();
        let mut servers: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        servers.sort();
        servers
    }

    /// Find which peer hosts `client_id`.
    #[must_use]
    pub fn locate(&self, client_id: &str) -> Option<String> {
        self.purge();
        self.peers
            .iter()
            .find(|e| e.roster.clients.iter().any(|c| c.id == client_id))
            .map(|e| e.key().clone())
    }

    /// Forget a peer.
    ///
    /// Returns `true` if the peer was known.
    pub fn remove(&self, server: &str) -> bool {
        self.peers.remove(server).is_some()
    }

    /// Number of peers with a fresh roster.
    #[must_use]
    pub fn len(&self) -> usize {
        self.purge();
        self.peers.len()
    }

    /// Check if no peer has a fresh roster.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self) {
        self.peers.retain(|_, stored| stored.is_fresh(self.ttl));
    }
}

/// Payload handler that peels presence frames off the inbound stream.
///
/// Presence and departure frames update the [`RemoteRoster`]; anything else
/// goes to the wrapped handler untouched.
pub struct PresenceTracker {
    roster: Arc<RemoteRoster>,
    inner: Arc<dyn PayloadHandler>,
}

impl PresenceTracker {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(roster: Arc<RemoteRoster>, inner: Arc<dyn PayloadHandler>) -> Self {
        Self { roster, inner }
    }

    /// Get the tracked roster.
    #[must_use]
    pub fn roster(&self) -> &Arc<RemoteRoster> {
        &self.roster
    }
}

#[async_trait]
impl PayloadHandler for PresenceTracker {
    async fn on_message_received(&self, channel_id: &str, sender: Option<&str>, payload: Bytes) {
        let Some(frame) = codec::try_decode(&payload) else {
            self.inner.on_message_received(channel_id, sender, payload).await;
            return;
        };

        if let Some(sender) = sender {
            if sender != frame.server() {
                trace!(sender, server = frame.server(), "Dropping presence frame for another server");
                return;
            }
        }

        match frame {
            Frame::Presence {
                server,
                timestamp,
                clients,
            } => {
                self.roster.record(&server, timestamp, clients);
            }
            Frame::Departure { server, .. } => {
                if self.roster.remove(&server) {
                    debug!(server = %server, "Peer departed");
                }
            }
        }
    }
}
