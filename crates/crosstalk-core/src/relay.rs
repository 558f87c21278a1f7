//! Relay transport.
//!
//! Sends ride on a client connection through the proxy, which forwards them
//! to the other servers. There is no connection of our own: the broker is
//! "connected" whenever some local client can carry bytes.

use async_trait::async_trait;
use bytes::Bytes;
use crosstalk_transport::TransportError;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, trace};

use crate::broker::{Broker, BrokerError};
use crate::config::{TransportKind, RELAY_CHANNEL};
use crate::host::{PayloadHandler, RelayError, RelayMessenger, RosterSource};
use crate::state::BrokerState;

fn provisioning(e: &RelayError) -> BrokerError {
    BrokerError::Provisioning(TransportError::Unavailable(format!("relay channel: {e}")))
}

/// Broker that relays through the proxy's plugin channel.
pub struct RelayBroker {
    server_name: String,
    messenger: Arc<dyn RelayMessenger>,
    roster: Arc<dyn RosterSource>,
    handler: Arc<dyn PayloadHandler>,
    state: BrokerState,
    /// Serializes start and stop so channel registration never interleaves.
    lifecycle: Mutex<()>,
}

impl RelayBroker {
    /// Create a stopped broker.
    #[must_use]
    pub fn new(
        server_name: impl Into<String>,
        messenger: Arc<dyn RelayMessenger>,
        roster: Arc<dyn RosterSource>,
        handler: Arc<dyn PayloadHandler>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            messenger,
            roster,
            handler,
            state: BrokerState::new(),
            lifecycle: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Broker for RelayBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.state.claim_start() {
            return Ok(());
        }

        if let Err(e) = self.messenger.register_outgoing(RELAY_CHANNEL) {
            self.state.claim_stop();
            return Err(provisioning(&e));
        }
        if let Err(e) = self
            .messenger
            .register_incoming(RELAY_CHANNEL, Arc::clone(&self.handler))
        {
            self.messenger.unregister_outgoing(RELAY_CHANNEL);
            self.state.claim_stop();
            return Err(provisioning(&e));
        }

        info!(server = %self.server_name, channel = RELAY_CHANNEL, "Relay broker started");
        Ok(())
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.state.claim_stop() {
            return;
        }
        self.messenger.unregister_outgoing(RELAY_CHANNEL);
        self.messenger.unregister_incoming(RELAY_CHANNEL);
        info!(server = %self.server_name, "Relay broker stopped");
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), BrokerError> {
        if !self.state.is_started() {
            return Err(BrokerError::TransportUnavailable(
                "relay broker not started".to_string(),
            ));
        }

        let clients = self.roster.clients();
        let client = clients.choose(&mut rand::thread_rng()).ok_or_else(|| {
            BrokerError::TransportUnavailable("no local client to relay through".to_string())
        })?;

        trace!(client = client.id(), len = payload.len(), "Relaying payload");
        client
            .relay(RELAY_CHANNEL, payload)
            .map_err(|e| BrokerError::TransportUnavailable(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.state.is_started() && !self.roster.clients().is_empty()
    }

    fn is_started(&self) -> bool {
        self.state.is_started()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LocalClient, StaticRoster};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeMessenger {
        outgoing: Mutex<HashSet<String>>,
        incoming: Mutex<HashSet<String>>,
        reject_incoming: bool,
        register_delay: Option<std::time::Duration>,
    }

    impl RelayMessenger for FakeMessenger {
        fn register_outgoing(&self, channel: &str) -> Result<(), RelayError> {
            if let Some(delay) = self.register_delay {
                std::thread::sleep(delay);
            }
            self.outgoing.lock().insert(channel.to_string());
            Ok(())
        }

        fn register_incoming(
            &self,
            channel: &str,
            _handler: Arc<dyn PayloadHandler>,
        ) -> Result<(), RelayError> {
            if self.reject_incoming {
                return Err(RelayError::Registration("channel taken".into()));
            }
            self.incoming.lock().insert(channel.to_string());
            Ok(())
        }

        fn unregister_outgoing(&self, channel: &str) {
            self.outgoing.lock().remove(channel);
        }

        fn unregister_incoming(&self, channel: &str) {
            self.incoming.lock().remove(channel);
        }
    }

    struct Ignore;

    #[async_trait]
    impl PayloadHandler for Ignore {
        async fn on_message_received(&self, _: &str, _: Option<&str>, _: Bytes) {}
    }

    #[derive(Default)]
    struct RecordingClient {
        relayed: Mutex<Vec<(String, Bytes)>>,
    }

    impl LocalClient for RecordingClient {
        fn id(&self) -> &str {
            "7c1e"
        }

        fn relay(&self, channel: &str, payload: Bytes) -> Result<(), RelayError> {
            self.relayed.lock().push((channel.to_string(), payload));
            Ok(())
        }
    }

    fn broker(messenger: Arc<FakeMessenger>, roster: Arc<StaticRoster>) -> RelayBroker {
        RelayBroker::new("lobby", messenger, roster, Arc::new(Ignore))
    }

    #[tokio::test]
    async fn test_start_registers_both_directions() {
        let messenger = Arc::new(FakeMessenger::default());
        let broker = broker(Arc::clone(&messenger), Arc::new(StaticRoster::new()));

        broker.start().await.unwrap();
        broker.start().await.unwrap();
        assert!(messenger.outgoing.lock().contains(RELAY_CHANNEL));
        assert!(messenger.incoming.lock().contains(RELAY_CHANNEL));

        broker.stop().await;
        broker.stop().await;
        assert!(messenger.outgoing.lock().is_empty());
        assert!(messenger.incoming.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back() {
        let messenger = Arc::new(FakeMessenger {
            reject_incoming: true,
            ..Default::default()
        });
        let broker = broker(Arc::clone(&messenger), Arc::new(StaticRoster::new()));

        assert!(matches!(
            broker.start().await,
            Err(BrokerError::Provisioning(_))
        ));
        assert!(!broker.is_started());
        assert!(messenger.outgoing.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_start_leaves_nothing_registered() {
        let messenger = Arc::new(FakeMessenger {
            register_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let broker = Arc::new(broker(Arc::clone(&messenger), Arc::new(StaticRoster::new())));

        let starting = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.stop().await;
        starting.await.unwrap().unwrap();

        assert!(!broker.is_started());
        assert!(messenger.outgoing.lock().is_empty());
        assert!(messenger.incoming.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_clients_fails() {
        let broker = broker(
            Arc::new(FakeMessenger::default()),
            Arc::new(StaticRoster::new()),
        );
        broker.start().await.unwrap();

        assert!(!broker.is_connected());
        let result = broker.send_data(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(BrokerError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_send_through_only_client() {
        let roster = Arc::new(StaticRoster::new());
        let client = Arc::new(RecordingClient::default());
        roster.add(client.clone());
        let broker = broker(Arc::new(FakeMessenger::default()), roster);

        assert!(broker.send_data(Bytes::from_static(b"x")).await.is_err());

        broker.start().await.unwrap();
        assert!(broker.is_connected());
        broker.send_data(Bytes::from_static(b"x")).await.unwrap();

        let relayed = client.relayed.lock();
        assert_eq!(
            *relayed,
            vec![(RELAY_CHANNEL.to_string(), Bytes::from_static(b"x"))]
        );
    }
}
