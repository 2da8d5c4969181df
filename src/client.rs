//! Client builder and connection pool.
//!
//! The [`ClientBuilder`] provides a fluent API over [`ClientConfig`]. The
//! [`Client`] owns a fixed set of supervised connections and hands out
//! [`Pipeline`]s bound to them round-robin.
//!
//! # Example
//!
//! ```ignore
//! use metapipe::{Client, MGetOptions, MSetOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("127.0.0.1:11211")
//!         .num_conns(4)
//!         .max_commands_per_batch(64)
//!         .build()?;
//!
//!     let pipeline = client.pipeline();
//!     let set = pipeline.mset("key01", b"ABCD", MSetOptions::default());
//!     let get = pipeline.mget("key01", MGetOptions::default());
//!     pipeline.execute();
//!
//!     set.resolve().await?;
//!     println!("{:?}", get.resolve().await?.data);
//!     pipeline.finish();
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer_pool::BufferPool;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::health::HealthChecker;
use crate::pipeline::Pipeline;
use crate::transport::{Dialer, TcpDialer};

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    dialer: Option<Arc<dyn Dialer>>,
}

impl ClientBuilder {
    /// Start from the default configuration for `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(addr))
    }

    /// Start from an existing configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            dialer: None,
        }
    }

    /// Number of connections in the pool.
    ///
    /// Default: 4
    pub fn num_conns(mut self, n: usize) -> Self {
        self.config.num_conns = n;
        self
    }

    /// Socket read buffer and initial framer capacity.
    ///
    /// Default: 16 KiB
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Sub-commands per batch before spilling into a sibling batch.
    ///
    /// Default: 128
    pub fn max_commands_per_batch(mut self, n: usize) -> Self {
        self.config.max_commands_per_batch = n;
        self
    }

    /// Outstanding sub-commands per connection before writes stall.
    ///
    /// Default: 8192
    pub fn write_limit(mut self, limit: u64) -> Self {
        self.config.write_limit = limit;
        self
    }

    /// Slots in each connection's in-flight ring.
    ///
    /// Default: 1024
    pub fn in_flight_capacity(mut self, capacity: usize) -> Self {
        self.config.in_flight_capacity = capacity;
        self
    }

    /// Largest `VA` body accepted from the server.
    ///
    /// Default: 1 GiB
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Delay between failed dials.
    ///
    /// Default: 10 seconds
    pub fn retry_duration(mut self, duration: Duration) -> Self {
        self.config.retry_duration = duration;
        self
    }

    /// Health-check interval; `Duration::ZERO` disables probing.
    ///
    /// Default: 30 seconds
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    /// Replace the default TCP dialer.
    pub fn dialer(mut self, dialer: impl Dialer) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Validate the configuration and start every connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Client> {
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(TcpDialer::new(self.config.connect_timeout)),
        };
        Client::start(self.config, dialer)
    }
}

/// A pool of pipelined connections to one server.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    conns: Vec<Arc<Connection>>,
    seq: Arc<AtomicU64>,
    pool: Arc<BufferPool>,
    health: Mutex<Option<HealthChecker>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Start a client from `config` with the default TCP dialer.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ClientBuilder::from_config(config).build()
    }

    /// Start a client from `config` with a custom dialer.
    pub fn with_dialer(config: ClientConfig, dialer: impl Dialer) -> Result<Self> {
        ClientBuilder::from_config(config).dialer(dialer).build()
    }

    fn start(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(BufferPool::new());
        let options = config.connection_options();
        let conns: Vec<Arc<Connection>> = (0..config.num_conns)
            .map(|_| {
                Arc::new(Connection::spawn(
                    config.addr.clone(),
                    dialer.clone(),
                    options.clone(),
                    pool.clone(),
                ))
            })
            .collect();

        let seq = Arc::new(AtomicU64::new(0));
        let health = if config.health_check_interval.is_zero() {
            None
        } else {
            Some(HealthChecker::spawn(
                conns.clone(),
                seq.clone(),
                config.health_check_interval,
            ))
        };

        tracing::info!(
            "Client for {} started with {} connections",
            config.addr,
            config.num_conns
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                conns,
                seq,
                pool,
                health: Mutex::new(health),
            }),
        })
    }

    /// Create a pipeline on the next connection in round-robin order.
    pub fn pipeline(&self) -> Pipeline {
        let seq = self.inner.seq.fetch_add(1, Ordering::AcqRel);
        let index = (seq % self.inner.conns.len() as u64) as usize;
        Pipeline::new(
            self.inner.conns[index].clone(),
            self.inner.pool.clone(),
            self.inner.config.max_commands_per_batch,
        )
    }

    /// Number of connections in the pool.
    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }

    /// The pooled connections, in round-robin order.
    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.inner.conns
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Stop health checks, shut every connection down and wait for all of
    /// them to close. Idempotent.
    pub async fn shutdown(&self) {
        let health = self
            .inner
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(health) = health {
            health.shutdown().await;
        }

        for conn in &self.inner.conns {
            conn.shutdown();
        }
        for conn in &self.inner.conns {
            conn.wait_close_completed().await;
        }
        tracing::info!("Client for {} shut down", self.inner.config.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::error::MemcacheError;
    use crate::transport::BoxedStream;
    use tokio::io::duplex;

    fn refusing_dialer(_addr: String) -> impl std::future::Future<Output = std::io::Result<BoxedStream>> {
        async {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        }
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = Client::builder("cache:11211")
            .num_conns(2)
            .buffer_size(4096)
            .max_commands_per_batch(16)
            .write_limit(100)
            .retry_duration(Duration::from_millis(5))
            .read_timeout(Duration::from_secs(1));
        assert_eq!(builder.config.addr, "cache:11211");
        assert_eq!(builder.config.num_conns, 2);
        assert_eq!(builder.config.max_commands_per_batch, 16);
        assert_eq!(builder.config.read_timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = Client::builder("cache:11211").num_conns(0).build();
        assert!(matches!(result, Err(MemcacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_pipelines_round_robin() {
        let dialer = |_addr: String| async move {
            let (client, server) = duplex(1024);
            // Keep the peer open for the life of the test runtime.
            tokio::spawn(async move {
                let _server = server;
                std::future::pending::<()>().await;
            });
            Ok::<BoxedStream, std::io::Error>(Box::new(client))
        };
        let client = Client::builder("mock")
            .num_conns(3)
            .health_check_interval(Duration::ZERO)
            .dialer(dialer)
            .build()
            .unwrap();

        let picked: Vec<*const Connection> = (0..6)
            .map(|_| client.pipeline().connection() as *const Connection)
            .collect();
        assert_eq!(picked[0], picked[3]);
        assert_eq!(picked[1], picked[4]);
        assert_ne!(picked[0], picked[1]);
        assert_ne!(picked[1], picked[2]);

        client.shutdown().await;
        for conn in client.connections() {
            assert_eq!(conn.state(), ConnectionState::Closed);
        }
    }

    #[tokio::test]
    async fn test_shutdown_while_dialing_fails() {
        let client = Client::builder("mock")
            .num_conns(2)
            .retry_duration(Duration::from_secs(3600))
            .dialer(refusing_dialer)
            .build()
            .unwrap();
        assert_eq!(client.connection_count(), 2);

        let err = client
            .pipeline()
            .version()
            .resolve()
            .await
            .unwrap_err();
        assert!(err.is_connection_fatal());

        tokio::time::timeout(Duration::from_secs(1), client.shutdown())
            .await
            .unwrap();
        client.shutdown().await;
    }
}
