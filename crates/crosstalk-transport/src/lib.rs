//! # crosstalk-transport
//!
//! Message bus abstraction layer for Crosstalk.
//!
//! This crate provides a unified interface over publish/subscribe buses:
//!
//! - **Redis** - the production bus (feature `redis`, on by default)
//! - **Memory** - an in-process bus for single-host setups and tests
//!
//! ## Bus Abstraction
//!
//! Every bus implements [`BusConnector`], which hands out publishing
//! [`BusConnection`]s and [`BusSubscription`]s. Publishing connections are
//! normally borrowed from a [`ConnectionPool`].
//!
//! ```rust,ignore
//! use crosstalk_transport::{BusConnector, ConnectionPool, MemoryBus, PoolConfig};
//! use std::sync::Arc;
//!
//! async fn announce(bus: MemoryBus) {
//!     let pool = ConnectionPool::new(Arc::new(bus), PoolConfig::default());
//!     let mut conn = pool.acquire().await.unwrap();
//!     conn.publish("crosstalk:main", "lobby|aGk=").await.unwrap();
//! }
//! ```

pub mod memory;
pub mod pool;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis_bus;

pub use memory::MemoryBus;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use traits::{
    redact_endpoint, BusConnection, BusConnector, BusMessage, BusSubscription, TransportError,
};

#[cfg(feature = "redis")]
pub use redis_bus::RedisConnector;
