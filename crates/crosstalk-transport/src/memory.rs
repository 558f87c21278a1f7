//! In-process message bus.
//!
//! `MemoryBus` implements [`BusConnector`] on top of tokio broadcast channels.
//! It serves brokers that share one process and doubles as a controllable bus
//! for tests: outages, injected publish failures and failing health checks
//! can be switched on at runtime.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::traits::{BusConnection, BusConnector, BusMessage, BusSubscription, TransportError};

/// Default broadcast capacity per channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A cloneable handle to an in-process bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

struct MemoryBusInner {
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
    available: AtomicBool,
    /// Bumped on every outage; connections and subscriptions from an older
    /// epoch are dead.
    epoch: watch::Sender<u64>,
    connects: AtomicUsize,
    connects_in_flight: AtomicUsize,
    peak_connects_in_flight: AtomicUsize,
    subscribes: AtomicUsize,
    failing_publishes: AtomicUsize,
    failing_health_checks: AtomicUsize,
    publish_failure_rate: Mutex<f64>,
}

impl MemoryBusInner {
    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn roll_publish_failure(&self) -> bool {
        let rate = *self.publish_failure_rate.lock();
        rate > 0.0 && rand::thread_rng().gen_bool(rate.min(1.0))
    }
}

impl MemoryBus {
    /// Create a new, available bus.
    #[must_use]
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryBusInner {
                channels: DashMap::new(),
                available: AtomicBool::new(true),
                epoch,
                connects: AtomicUsize::new(0),
                connects_in_flight: AtomicUsize::new(0),
                peak_connects_in_flight: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
                failing_publishes: AtomicUsize::new(0),
                failing_health_checks: AtomicUsize::new(0),
                publish_failure_rate: Mutex::new(0.0),
            }),
        }
    }

    /// Take the bus down or bring it back.
    ///
    /// Going down severs every open connection and subscription.
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::AcqRel);
        if was && !available {
            self.inner.epoch.send_modify(|epoch| *epoch += 1);
            debug!("Memory bus outage");
        } else if !was && available {
            debug!("Memory bus restored");
        }
    }

    /// Check whether the bus is up.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.failing_publishes.store(count, Ordering::Release);
    }

    /// Make the next `count` liveness checks fail.
    pub fn fail_next_health_checks(&self, count: usize) {
        self.inner
            .failing_health_checks
            .store(count, Ordering::Release);
    }

    /// Make every publish fail with the given probability.
    pub fn set_publish_failure_rate(&self, rate: f64) {
        *self.inner.publish_failure_rate.lock() = rate;
    }

    /// Publish a raw message, bypassing connections.
    ///
    /// Returns the number of subscribers that received it.
    pub fn inject(&self, channel: &str, payload: impl Into<String>) -> usize {
        self.inner
            .sender(channel)
            .send(BusMessage::new(channel, payload))
            .unwrap_or(0)
    }

    /// Number of live subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of successful `connect` calls.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }

    /// Highest number of `connect` calls observed in flight at once.
    #[must_use]
    pub fn peak_connects_in_flight(&self) -> usize {
        self.inner.peak_connects_in_flight.load(Ordering::Acquire)
    }

    /// Number of successful `subscribe` calls.
    #[must_use]
    pub fn subscribes(&self) -> usize {
        self.inner.subscribes.load(Ordering::Acquire)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, TransportError> {
        let in_flight = self.inner.connects_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = InFlight(&self.inner.connects_in_flight);
        self.inner
            .peak_connects_in_flight
            .fetch_max(in_flight, Ordering::AcqRel);

        // Give concurrent callers a chance to overlap, like a real handshake would
        tokio::task::yield_now().await;

        if !self.is_available() {
            return Err(TransportError::Unavailable("memory bus is down".into()));
        }
        self.inner.connects.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            epoch: self.inner.current_epoch(),
            open: true,
        }))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>, TransportError> {
        tokio::task::yield_now().await;

        if !self.is_available() {
            return Err(TransportError::Unavailable("memory bus is down".into()));
        }

        let rx = self.inner.sender(channel).subscribe();
        let mut epoch_rx = self.inner.epoch.subscribe();
        let epoch = *epoch_rx.borrow_and_update();
        self.inner.subscribes.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            rx,
            epoch_rx,
            epoch,
        }))
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

/// A publishing connection to a [`MemoryBus`].
struct MemoryConnection {
    inner: Arc<MemoryBusInner>,
    epoch: u64,
    open: bool,
}

impl MemoryConnection {
    fn alive(&self) -> bool {
        self.open
            && self.inner.available.load(Ordering::Acquire)
            && self.inner.current_epoch() == self.epoch
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.alive() {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    async fn publish(&mut self, channel: &str, message: &str) -> Result<usize, TransportError> {
        if MemoryBusInner::take_one(&self.inner.failing_publishes) {
            return Err(TransportError::PublishFailed("injected failure".into()));
        }
        if self.inner.roll_publish_failure() {
            return Err(TransportError::PublishFailed("random failure".into()));
        }
        if !self.alive() {
            return Err(TransportError::ConnectionClosed);
        }

        let sender = self.inner.sender(channel);
        Ok(sender.send(BusMessage::new(channel, message)).unwrap_or(0))
    }

    fn is_open(&self) -> Result<bool, TransportError> {
        if MemoryBusInner::take_one(&self.inner.failing_health_checks) {
            return Err(TransportError::Other("injected health check failure".into()));
        }
        Ok(self.alive())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}

/// A subscription to one [`MemoryBus`] channel.
struct MemorySubscription {
    channel: String,
    rx: broadcast::Receiver<BusMessage>,
    epoch_rx: watch::Receiver<u64>,
    epoch: u64,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<BusMessage>, TransportError> {
        loop {
            if *self.epoch_rx.borrow() != self.epoch {
                return Err(TransportError::ConnectionClosed);
            }

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %self.channel, skipped, "Subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
                changed = self.epoch_rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}
