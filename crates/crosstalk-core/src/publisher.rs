//! Dedicated publisher channel.
//!
//! Publishing on every send through a pool checkout/check-in costs a lock
//! round-trip and occasionally a handshake. The publisher instead keeps one
//! pooled connection checked out for as long as it stays healthy.

use crosstalk_transport::{ConnectionPool, PooledConnection, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Single long-lived publishing connection.
///
/// The slot holds at most one connection. Every path that replaces it (the
/// send path and [`recreate`](Self::recreate)) runs under the same mutex, so
/// a replacement never overlaps an in-flight publish or another replacement.
pub struct DedicatedPublisher {
    pool: Arc<ConnectionPool>,
    channel: String,
    slot: Mutex<Option<PooledConnection>>,
    recreations: AtomicU64,
}

impl DedicatedPublisher {
    /// Check out the initial connection.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be acquired.
    pub async fn provision(
        pool: Arc<ConnectionPool>,
        channel: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let conn = pool.acquire().await?;
        Ok(Self {
            pool,
            channel: channel.into(),
            slot: Mutex::new(Some(conn)),
            recreations: AtomicU64::new(0),
        })
    }

    /// Get the channel this publisher writes to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Number of times the connection has been replaced.
    #[must_use]
    pub fn recreations(&self) -> u64 {
        self.recreations.load(Ordering::Relaxed)
    }

    /// Publish one encoded envelope line.
    ///
    /// A failed publish is retried exactly once on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns the error of the retry if both attempts fail. The slot is
    /// left empty and the next call acquires a new connection.
    pub async fn publish(&self, message: &str) -> Result<(), TransportError> {
        let mut slot = self.slot.lock().await;

        let first = match self.ensure_healthy(&mut slot).await {
            Ok(conn) => conn.publish(&self.channel, message).await,
            Err(e) => Err(e),
        };
        let Err(first_error) = first else {
            return Ok(());
        };
        debug!(channel = %self.channel, error = %first_error, "Publish failed, retrying on a new connection");

        self.replace(&mut slot).await?;
        let retry = match slot.as_mut() {
            Some(conn) => conn.publish(&self.channel, message).await,
            None => Err(TransportError::ConnectionClosed),
        };
        match retry {
            Ok(_) => Ok(()),
            Err(e) => {
                Self::discard(&mut slot).await;
                Err(e)
            }
        }
    }

    /// Replace the connection, e.g. after the subscriber saw the bus drop.
    ///
    /// If no connection can be acquired the slot stays empty and the next
    /// publish tries again.
    pub async fn recreate(&self) {
        let mut slot = self.slot.lock().await;
        if self.pool.is_closed() {
            Self::discard(&mut slot).await;
            return;
        }
        if let Err(e) = self.replace(&mut slot).await {
            debug!(channel = %self.channel, error = %e, "Could not recreate publisher connection");
        }
    }

    /// Close the connection. Later publishes fail once the pool is closed.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        Self::discard(&mut slot).await;
    }

    async fn ensure_healthy<'a>(
        &self,
        slot: &'a mut Option<PooledConnection>,
    ) -> Result<&'a mut PooledConnection, TransportError> {
        let healthy = match slot.as_ref() {
            // A failing health check counts as dead
            Some(conn) => conn.is_open().unwrap_or(false),
            None => false,
        };
        if !healthy {
            trace!(channel = %self.channel, "Publisher connection missing or dead");
            self.replace(slot).await?;
        }
        slot.as_mut().ok_or(TransportError::ConnectionClosed)
    }

    async fn replace(&self, slot: &mut Option<PooledConnection>) -> Result<(), TransportError> {
        Self::discard(slot).await;
        let conn = self.pool.acquire().await?;
        *slot = Some(conn);
        self.recreations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn discard(slot: &mut Option<PooledConnection>) {
        if let Some(conn) = slot.take() {
            conn.discard().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosstalk_transport::{BusConnector, BusSubscription, MemoryBus, PoolConfig};

    const CHANNEL: &str = "crosstalk:test";

    async fn setup() -> (MemoryBus, Box<dyn BusSubscription>, DedicatedPublisher) {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(CHANNEL).await.unwrap();
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(bus.clone()),
            PoolConfig::default(),
        ));
        let publisher = DedicatedPublisher::provision(pool, CHANNEL).await.unwrap();
        (bus, sub, publisher)
    }

    #[tokio::test]
    async fn test_publish_reuses_connection() {
        let (bus, mut sub, publisher) = setup().await;

        publisher.publish("lobby|YQ==").await.unwrap();
        publisher.publish("lobby|Yg==").await.unwrap();

        assert_eq!(sub.next_message().await.unwrap().unwrap().payload, "lobby|YQ==");
        assert_eq!(sub.next_message().await.unwrap().unwrap().payload, "lobby|Yg==");
        assert_eq!(bus.connects(), 1);
        assert_eq!(publisher.recreations(), 0);
    }

    #[tokio::test]
    async fn test_single_failure_is_retried_once() {
        let (bus, mut sub, publisher) = setup().await;

        bus.fail_next_publishes(1);
        publisher.publish("lobby|YQ==").await.unwrap();

        assert_eq!(sub.next_message().await.unwrap().unwrap().payload, "lobby|YQ==");
        assert_eq!(publisher.recreations(), 1);
    }

    #[tokio::test]
    async fn test_second_failure_gives_up() {
        let (bus, _sub, publisher) = setup().await;

        bus.fail_next_publishes(2);
        assert!(publisher.publish("lobby|YQ==").await.is_err());

        // The next call starts over on a fresh connection
        assert!(publisher.publish("lobby|YQ==").await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_health_check_replaces_connection() {
        let (bus, mut sub, publisher) = setup().await;

        bus.fail_next_health_checks(1);
        publisher.publish("lobby|YQ==").await.unwrap();

        assert_eq!(sub.next_message().await.unwrap().unwrap().payload, "lobby|YQ==");
        assert_eq!(publisher.recreations(), 1);
        assert_eq!(bus.connects(), 2);
    }

    #[tokio::test]
    async fn test_recovers_after_outage() {
        let (bus, _sub, publisher) = setup().await;

        bus.set_available(false);
        assert!(publisher.publish("lobby|YQ==").await.is_err());

        bus.set_available(true);
        let mut sub = bus.subscribe(CHANNEL).await.unwrap();
        publisher.publish("lobby|Yg==").await.unwrap();
        assert_eq!(sub.next_message().await.unwrap().unwrap().payload, "lobby|Yg==");
    }

    #[tokio::test]
    async fn test_recreate_swaps_connection() {
        let (bus, _sub, publisher) = setup().await;

        publisher.recreate().await;
        assert_eq!(publisher.recreations(), 1);
        assert_eq!(bus.connects(), 2);
    }
}
