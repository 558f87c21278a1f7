//! Bounded pool of publishing connections.
//!
//! The pool caps the number of live connections to the bus, keeps a few idle
//! ones warm, and hands them out as [`PooledConnection`] guards that return
//! to the idle list when dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::traits::{BusConnection, BusConnector, TransportError};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections, idle or checked out.
    pub max_total: usize,
    /// Maximum number of idle connections kept for reuse.
    pub max_idle: usize,
    /// Number of connections opened eagerly by [`ConnectionPool::warm_up`].
    pub min_idle: usize,
    /// How long `acquire` waits for a free slot when the pool is exhausted.
    pub max_wait: Duration,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 10,
            max_idle: 5,
            min_idle: 2,
            max_wait: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle list.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
}

struct IdleConnection {
    conn: Box<dyn BusConnection>,
    permit: OwnedSemaphorePermit,
    since: Instant,
}

struct PoolShared {
    idle: Mutex<VecDeque<IdleConnection>>,
    closed: AtomicBool,
    config: PoolConfig,
}

impl PoolShared {
    fn check_in(&self, conn: Box<dyn BusConnection>, permit: OwnedSemaphorePermit) {
        if self.closed.load(Ordering::Acquire) || !matches!(conn.is_open(), Ok(true)) {
            trace!("Dropping connection on check-in");
            return;
        }

        let mut idle = self.idle.lock();
        while idle
            .front()
            .is_some_and(|entry| entry.since.elapsed() > self.config.idle_timeout)
        {
            idle.pop_front();
        }
        if idle.len() >= self.config.max_idle {
            trace!(idle = idle.len(), "Idle list full, dropping connection");
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            permit,
            since: Instant::now(),
        });
    }

    fn check_out(&self) -> Option<(Box<dyn BusConnection>, OwnedSemaphorePermit)> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop_back() {
            if entry.since.elapsed() > self.config.idle_timeout {
                trace!("Evicting expired idle connection");
                continue;
            }
            if !matches!(entry.conn.is_open(), Ok(true)) {
                trace!("Evicting dead idle connection");
                continue;
            }
            return Some((entry.conn, entry.permit));
        }
        None
    }
}

/// A bounded pool of bus connections.
pub struct ConnectionPool {
    connector: Arc<dyn BusConnector>,
    permits: Arc<Semaphore>,
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a new pool. No connection is opened until first use.
    #[must_use]
    pub fn new(connector: Arc<dyn BusConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            permits: Arc::new(Semaphore::new(config.max_total)),
            shared: Arc::new(PoolShared {
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Get the endpoint of the underlying connector.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Check out a connection, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PoolClosed`] after [`close`](Self::close),
    /// [`TransportError::PoolExhausted`] if no slot frees up within
    /// `max_wait`, or the connector's error if opening a connection fails.
    pub async fn acquire(&self) -> Result<PooledConnection, TransportError> {
        if self.is_closed() {
            return Err(TransportError::PoolClosed);
        }

        if let Some((conn, permit)) = self.shared.check_out() {
            return Ok(self.guard(conn, permit));
        }

        let permit = match tokio::time::timeout(
            self.shared.config.max_wait,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TransportError::PoolClosed),
            Err(_) => {
                // A connection may have been checked in while we waited
                if let Some((conn, permit)) = self.shared.check_out() {
                    return Ok(self.guard(conn, permit));
                }
                return Err(TransportError::PoolExhausted);
            }
        };

        let conn = self.connector.connect().await?;
        trace!(endpoint = %self.connector.endpoint(), "Opened pooled connection");
        Ok(self.guard(conn, permit))
    }

    /// Open `min_idle` connections up front so the first sends skip the handshake.
    ///
    /// # Errors
    ///
    /// Returns the first connection error.
    pub async fn warm_up(&self) -> Result<(), TransportError> {
        let mut warmed = Vec::with_capacity(self.shared.config.min_idle);
        for _ in 0..self.shared.config.min_idle {
            warmed.push(self.acquire().await?);
        }
        debug!(count = warmed.len(), "Warmed up connection pool");
        // Dropping the guards parks them in the idle list
        drop(warmed);
        Ok(())
    }

    /// Close the pool and every idle connection.
    ///
    /// Checked-out connections are dropped when their guards are released.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let drained: Vec<IdleConnection> = self.shared.idle.lock().drain(..).collect();
        for mut entry in drained {
            if let Err(e) = entry.conn.close().await {
                trace!(error = %e, "Error closing idle connection");
            }
        }
        debug!(endpoint = %self.connector.endpoint(), "Connection pool closed");
    }

    /// Check if the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Get pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().len();
        let live = self
            .shared
            .config
            .max_total
            .saturating_sub(self.permits.available_permits());
        PoolStats {
            idle,
            in_use: live.saturating_sub(idle),
        }
    }

    fn guard(&self, conn: Box<dyn BusConnection>, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A checked-out connection.
///
/// Dropping the guard returns the connection to the pool; [`discard`](Self::discard)
/// closes it instead.
pub struct PooledConnection {
    conn: Option<Box<dyn BusConnection>>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<PoolShared>,
}

impl PooledConnection {
    /// Round-trip to the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the ping fails.
    pub async fn ping(&mut self) -> Result<(), TransportError> {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Publish a message on a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the publish fails.
    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<usize, TransportError> {
        match self.conn.as_mut() {
            Some(conn) => conn.publish(channel, message).await,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Non-blocking liveness check.
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails.
    pub fn is_open(&self) -> Result<bool, TransportError> {
        match self.conn.as_ref() {
            Some(conn) => conn.is_open(),
            None => Ok(false),
        }
    }

    /// Close the connection instead of returning it to the pool.
    pub async fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                trace!(error = %e, "Error closing discarded connection");
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            self.shared.check_in(conn, permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;

    fn pool(bus: &MemoryBus, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(bus.clone()), config)
    }

    #[tokio::test]
    async fn test_reuses_idle_connections() {
        let bus = MemoryBus::new();
        let pool = pool(&bus, PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 0 });

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(bus.connects(), 1);
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1 });
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let bus = MemoryBus::new();
        let pool = pool(
            &bus,
            PoolConfig {
                max_total: 1,
                max_wait: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let _held = pool.acquire().await.unwrap();
        assert!(matches!(
            pool.acquire().await,
            Err(TransportError::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn test_discard_frees_slot_without_reuse() {
        let bus = MemoryBus::new();
        let pool = pool(
            &bus,
            PoolConfig {
                max_total: 1,
                ..Default::default()
            },
        );

        let conn = pool.acquire().await.unwrap();
        conn.discard().await;
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 0 });

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(bus.connects(), 2);
    }

    #[tokio::test]
    async fn test_dead_idle_connections_are_evicted() {
        let bus = MemoryBus::new();
        let pool = pool(&bus, PoolConfig::default());

        drop(pool.acquire().await.unwrap());
        bus.set_available(false);
        bus.set_available(true);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(bus.connects(), 2);
    }

    #[tokio::test]
    async fn test_warm_up_fills_idle_list() {
        let bus = MemoryBus::new();
        let pool = pool(&bus, PoolConfig::default());

        pool.warm_up().await.unwrap();
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let bus = MemoryBus::new();
        let pool = pool(&bus, PoolConfig::default());

        pool.warm_up().await.unwrap();
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.acquire().await,
            Err(TransportError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let bus = MemoryBus::new();
        let pool = pool(
            &bus,
            PoolConfig {
                max_total: 1,
                ..Default::default()
            },
        );

        bus.set_available(false);
        assert!(pool.acquire().await.is_err());

        bus.set_available(true);
        assert!(pool.acquire().await.is_ok());
    }
}
