//! Redis pub/sub bus.
//!
//! Publishing goes through multiplexed async connections; each subscription
//! owns a dedicated pub/sub connection, as Redis requires.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, trace};

use crate::traits::{
    redact_endpoint, BusConnection, BusConnector, BusMessage, BusSubscription, TransportError,
};

/// Default timeout for opening a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connector for a Redis server.
pub struct RedisConnector {
    client: redis::Client,
    endpoint: String,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Create a connector for a `redis://` or `rediss://` URI.
    ///
    /// No connection is made until [`BusConnector::connect`] or
    /// [`BusConnector::subscribe`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid.
    pub fn open(uri: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(uri)?;
        Ok(Self {
            client,
            endpoint: redact_endpoint(uri),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl BusConnector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, TransportError> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        trace!(endpoint = %self.endpoint, "Opened Redis connection");
        Ok(Box::new(RedisConnection { conn, open: true }))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>, TransportError> {
        let mut pubsub = tokio::time::timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| TransportError::Timeout)??;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        debug!(endpoint = %self.endpoint, channel = %channel, "Subscribed to Redis channel");
        Ok(Box::new(RedisSubscription {
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// A multiplexed Redis connection used for publishing.
struct RedisConnection {
    conn: redis::aio::MultiplexedConnection,
    /// Cleared on the first I/O error; the multiplexed connection gives no
    /// cheaper liveness signal.
    open: bool,
}

impl RedisConnection {
    fn track<T>(&mut self, result: redis::RedisResult<T>) -> Result<T, TransportError> {
        result.map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                self.open = false;
            }
            TransportError::from(e)
        })
    }
}

#[async_trait]
impl BusConnection for RedisConnection {
    async fn ping(&mut self) -> Result<(), TransportError> {
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut self.conn).await;
        self.track(result).map(|_| ())
    }

    async fn publish(&mut self, channel: &str, message: &str) -> Result<usize, TransportError> {
        let result: redis::RedisResult<usize> = self.conn.publish(channel, message).await;
        self.track(result)
    }

    fn is_open(&self) -> Result<bool, TransportError> {
        Ok(self.open)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the last handle closes the socket
        self.open = false;
        Ok(())
    }
}

/// A Redis channel subscription.
struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<BusMessage>, TransportError> {
        loop {
            let Some(msg) = self.messages.next().await else {
                // The stream ends when the pub/sub connection drops
                return Err(TransportError::ConnectionClosed);
            };

            match msg.get_payload::<String>() {
                Ok(payload) => {
                    return Ok(Some(BusMessage::new(msg.get_channel_name(), payload)));
                }
                Err(e) => {
                    trace!(error = %e, "Skipping non-text pub/sub payload");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_invalid_uri() {
        assert!(RedisConnector::open("not a uri").is_err());
    }

    #[test]
    fn test_endpoint_is_redacted() {
        let connector = RedisConnector::open("redis://:hunter2@localhost:6379").unwrap();
        assert_eq!(connector.endpoint(), "redis://***@localhost:6379");
    }
}
