//! Bus transport.
//!
//! Servers publish envelopes to a shared pub/sub channel and every server
//! subscribed to it receives them, including the sender, which filters its
//! own echo.

use async_trait::async_trait;
use bytes::Bytes;
use crosstalk_protocol::{envelope, Frame};
use crosstalk_transport::{BusConnector, ConnectionPool, TransportError};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, BrokerError};
use crate::config::{BrokerConfig, TransportKind};
use crate::host::{PayloadHandler, RosterSource};
use crate::presence::{
    encode_frame, now_millis, FrameSink, PresenceBroadcaster, PresenceHandle, PresenceTracker,
    RemoteRoster,
};
use crate::publisher::DedicatedPublisher;
use crate::state::BrokerState;
use crate::subscriber::{Dispatcher, SubscriberHandle, SubscriberLoop, SubscriptionListener};

/// Send path shared by `send_data` and the presence broadcaster.
struct Outbound {
    server_name: String,
    publisher: Arc<DedicatedPublisher>,
    pool: Arc<ConnectionPool>,
}

impl Outbound {
    async fn send(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let line = envelope::encode(&self.server_name, payload);
        self.publisher
            .publish(&line)
            .await
            .map_err(|e| BrokerError::TransportUnavailable(e.to_string()))
    }
}

#[async_trait]
impl FrameSink for Outbound {
    async fn send_frame(&self, frame: Bytes) -> Result<(), BrokerError> {
        self.send(&frame).await
    }
}

/// Background work owned by a started broker.
struct Running {
    outbound: Arc<Outbound>,
    subscriber: SubscriberHandle,
    presence: PresenceHandle,
}

/// Broker over a publish/subscribe bus.
pub struct BusBroker {
    config: Arc<BrokerConfig>,
    connector: Arc<dyn BusConnector>,
    handler: Arc<dyn PayloadHandler>,
    roster: Arc<dyn RosterSource>,
    peers: Arc<RemoteRoster>,
    backoff: Arc<dyn BackoffPolicy>,
    state: Arc<BrokerState>,
    lifecycle: Mutex<Option<Running>>,
    outbound: RwLock<Option<Arc<Outbound>>>,
}

impl BusBroker {
    /// Create a stopped broker.
    ///
    /// Presence frames from peers are recorded in [`BusBroker::peers`] and
    /// never reach `handler`.
    #[must_use]
    pub fn new(
        config: Arc<BrokerConfig>,
        connector: Arc<dyn BusConnector>,
        handler: Arc<dyn PayloadHandler>,
        roster: Arc<dyn RosterSource>,
    ) -> Self {
        let backoff = config.backoff_policy();
        let peers = Arc::new(RemoteRoster::new(config.presence().roster_ttl));
        Self {
            config,
            connector,
            handler,
            roster,
            peers,
            backoff,
            state: Arc::new(BrokerState::new()),
            lifecycle: Mutex::new(None),
            outbound: RwLock::new(None),
        }
    }

    /// Replace the reconnect backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Record peer presence in a shared roster instead of a private one.
    #[must_use]
    pub fn with_peer_roster(mut self, peers: Arc<RemoteRoster>) -> Self {
        self.peers = peers;
        self
    }

    /// Rosters announced by the other servers on the channel.
    #[must_use]
    pub fn peers(&self) -> &Arc<RemoteRoster> {
        &self.peers
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Number of times the publisher connection has been replaced since start.
    #[must_use]
    pub fn publisher_recreations(&self) -> u64 {
        self.outbound
            .read()
            .as_ref()
            .map_or(0, |outbound| outbound.publisher.recreations())
    }

    async fn provision(&self, pool: &Arc<ConnectionPool>) -> Result<DedicatedPublisher, TransportError> {
        {
            let mut probe = pool.acquire().await?;
            probe.ping().await?;
        }
        pool.warm_up().await?;
        DedicatedPublisher::provision(Arc::clone(pool), self.config.channel_name()).await
    }
}

#[async_trait]
impl Broker for BusBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state.is_started() {
            return Ok(());
        }

        let server = self.config.server_name();
        let channel = self.config.channel_name();
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&self.connector),
            self.config.pool().clone(),
        ));

        let publisher = match self.provision(&pool).await {
            Ok(publisher) => Arc::new(publisher),
            Err(e) => {
                pool.close().await;
                error!(
                    server,
                    endpoint = %self.connector.endpoint(),
                    error = %e,
                    "Failed to provision bus broker"
                );
                return Err(BrokerError::Provisioning(e));
            }
        };

        self.state.mark_started();

        let outbound = Arc::new(Outbound {
            server_name: server.to_string(),
            publisher: Arc::clone(&publisher),
            pool,
        });
        *self.outbound.write() = Some(Arc::clone(&outbound));

        let listener = SubscriptionListener::new(
            channel.clone(),
            server,
            Arc::clone(&self.state),
            Dispatcher::new(Arc::new(PresenceTracker::new(
                Arc::clone(&self.peers),
                Arc::clone(&self.handler),
            ))),
        );
        let subscriber = SubscriberLoop::new(
            Arc::clone(&self.connector),
            listener,
            publisher,
            Arc::clone(&self.backoff),
            Arc::clone(&self.state),
        )
        .spawn();

        let presence = PresenceBroadcaster::new(
            server,
            Arc::clone(&self.roster),
            Arc::clone(&outbound) as Arc<dyn FrameSink>,
            Arc::clone(&self.state),
            self.config.presence().clone(),
        )
        .spawn();

        *lifecycle = Some(Running {
            outbound,
            subscriber,
            presence,
        });

        info!(
            server,
            channel = %channel,
            endpoint = %self.connector.endpoint(),
            "Bus broker started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.state.claim_stop() {
            return;
        }
        self.outbound.write().take();

        let Some(running) = lifecycle.take() else {
            self.state.set_connected(false);
            return;
        };
        let server = self.config.server_name();

        // No presence tick may race the teardown below
        running.presence.cancel().await;

        match encode_frame(&Frame::departure(server, now_millis())) {
            Ok(frame) => {
                if let Err(e) = running.outbound.send(&frame).await {
                    debug!(server, error = %e, "Could not announce departure");
                }
            }
            Err(e) => debug!(server, error = %e, "Could not encode departure"),
        }

        running.subscriber.shutdown().await;
        running.outbound.publisher.close().await;
        running.outbound.pool.close().await;
        self.state.set_connected(false);

        info!(server, "Bus broker stopped");
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), BrokerError> {
        if !self.state.is_connected() {
            return Err(BrokerError::TransportUnavailable(
                "bus not connected".to_string(),
            ));
        }
        let outbound = self.outbound.read().clone().ok_or_else(|| {
            BrokerError::TransportUnavailable("bus broker not started".to_string())
        })?;
        outbound.send(&payload).await
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn is_started(&self) -> bool {
        self.state.is_started()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Bus
    }

    fn server_name(&self) -> &str {
        self.config.server_name()
    }
}
