//! Subscriber loop.
//!
//! Keeps one live subscription to the bus channel on a background task and
//! reconnects with backoff whenever it drops.
//!
//! ```text
//!              subscribe ok
//! Connecting ─────────────────▶ Subscribed
//!     ▲                             │
//!     │ backoff                     │ stream error / end
//!     │                             ▼
//!     └────────────────────── Disconnected
//! ```

use bytes::Bytes;
use crosstalk_protocol::envelope;
use crosstalk_transport::{BusConnector, BusMessage, TransportError};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::broker::BrokerError;
use crate::config::RELAY_CHANNEL;
use crate::host::PayloadHandler;
use crate::publisher::DedicatedPublisher;
use crate::state::BrokerState;

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Not subscribed; waiting out the backoff or stopped.
    Disconnected,
    /// Subscribe request in flight.
    Connecting,
    /// Subscription confirmed, messages flowing.
    Subscribed,
}

/// What happened to one inbound bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the payload handler.
    Dispatched,
    /// Arrived on a channel this listener does not own.
    WrongChannel,
    /// Not a valid envelope.
    Malformed,
    /// Sent by this server and echoed back by the bus.
    Echo,
}

/// Runs the payload handler off the subscriber task.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn PayloadHandler>,
}

impl Dispatcher {
    /// Create a dispatcher for `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn PayloadHandler>) -> Self {
        Self { handler }
    }

    /// Deliver one payload on its own task.
    ///
    /// A panicking handler is logged and the task ends; nothing propagates.
    pub fn dispatch(&self, sender: String, payload: Bytes) -> JoinHandle<()> {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let delivery = handler.on_message_received(RELAY_CHANNEL, Some(&sender), payload);
            if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
                error!(sender = %sender, "Payload handler panicked");
            }
        })
    }
}

/// Subscription callbacks.
///
/// Holds only what the callbacks touch: the channel, the local identity,
/// the shared flags and the dispatcher.
pub struct SubscriptionListener {
    channel: String,
    local_id: String,
    state: Arc<BrokerState>,
    dispatcher: Dispatcher,
}

impl SubscriptionListener {
    /// Create a listener.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        local_id: impl Into<String>,
        state: Arc<BrokerState>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            channel: channel.into(),
            local_id: local_id.into(),
            state,
            dispatcher,
        }
    }

    /// Get the subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The bus confirmed the subscription.
    pub fn on_subscribe(&self) {
        self.state.set_connected(true);
        info!(channel = %self.channel, server = %self.local_id, "Subscribed to bus channel");
    }

    /// The subscription ended.
    pub fn on_unsubscribe(&self) {
        self.state.set_connected(false);
    }

    /// Filter and dispatch one inbound message.
    pub fn on_message(&self, message: BusMessage) -> Delivery {
        if message.channel != self.channel {
            trace!(channel = %message.channel, "Ignoring message on foreign channel");
            return Delivery::WrongChannel;
        }

        let envelope = match envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(channel = %self.channel, error = %BrokerError::Malformed(e), "Dropping message");
                return Delivery::Malformed;
            }
        };

        if envelope.is_from(&self.local_id) {
            trace!(channel = %self.channel, "Dropping own message");
            return Delivery::Echo;
        }

        self.dispatcher.dispatch(envelope.sender, envelope.payload);
        Delivery::Dispatched
    }
}

/// The reconnecting subscription task.
pub struct SubscriberLoop {
    connector: Arc<dyn BusConnector>,
    listener: SubscriptionListener,
    publisher: Arc<DedicatedPublisher>,
    backoff: Arc<dyn BackoffPolicy>,
    state: Arc<BrokerState>,
}

impl SubscriberLoop {
    /// Create a subscriber loop.
    #[must_use]
    pub fn new(
        connector: Arc<dyn BusConnector>,
        listener: SubscriptionListener,
        publisher: Arc<DedicatedPublisher>,
        backoff: Arc<dyn BackoffPolicy>,
        state: Arc<BrokerState>,
    ) -> Self {
        Self {
            connector,
            listener,
            publisher,
            backoff,
            state,
        }
    }

    /// Start the loop on a background task.
    #[must_use]
    pub fn spawn(self) -> SubscriberHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriberState::Disconnected);
        let join = tokio::spawn(self.run(cancel.clone(), state_tx));
        SubscriberHandle {
            cancel,
            join,
            state_rx,
        }
    }

    async fn run(self, cancel: CancellationToken, state_tx: watch::Sender<SubscriberState>) {
        let channel = self.listener.channel().to_string();
        let mut attempt: u32 = 0;

        while self.state.is_started() && !cancel.is_cancelled() {
            state_tx.send_replace(SubscriberState::Connecting);

            let lost = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                lost = self.session(&state_tx, &mut attempt) => lost,
            };

            self.listener.on_unsubscribe();
            state_tx.send_replace(SubscriberState::Disconnected);
            if !self.state.is_started() {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.next_delay(attempt);
            warn!(
                channel = %channel,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %BrokerError::ConnectionLost(lost),
                "Bus subscription lost, reconnecting"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = async {
                    self.publisher.recreate().await;
                    tokio::time::sleep(delay).await;
                } => {}
            }
        }

        self.listener.on_unsubscribe();
        state_tx.send_replace(SubscriberState::Disconnected);
        debug!(channel = %channel, "Subscriber loop exited");
    }

    /// One subscription. Returns only when it fails.
    async fn session(
        &self,
        state_tx: &watch::Sender<SubscriberState>,
        attempt: &mut u32,
    ) -> TransportError {
        let mut subscription = match self.connector.subscribe(self.listener.channel()).await {
            Ok(subscription) => subscription,
            Err(e) => return e,
        };

        self.listener.on_subscribe();
        state_tx.send_replace(SubscriberState::Subscribed);
        *attempt = 0;

        loop {
            match subscription.next_message().await {
                Ok(Some(message)) => {
                    self.listener.on_message(message);
                }
                Ok(None) => return TransportError::ConnectionClosed,
                Err(e) => return e,
            }
        }
    }
}

/// Handle to a running subscriber loop.
///
/// Dropping the handle cancels the loop without waiting for it.
pub struct SubscriberHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    state_rx: watch::Receiver<SubscriberState>,
}

impl SubscriberHandle {
    /// Get the current subscription state.
    #[must_use]
    pub fn state(&self) -> SubscriberState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SubscriberState> {
        self.state_rx.clone()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.join).await {
            if e.is_panic() {
                error!("Subscriber loop panicked");
            }
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
